use std::error::Error;
use std::path::Path;

use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::client::{Client, ClientOpts};
use crate::framing;
use crate::message::{FileInfo, Goodbye, Message, Role};
use crate::states::sender_states;

use super::{pipe_pake, prompt_transfer_code};

/// Receive whatever the holder of the transfer code sends:
///     - rendezvous at the relay as the receiver half of the code's slot
///     - run the end-to-end key exchange with the sender through the pipe
///     - validate the inbound action sequence against the transfer graph
///     - write each announced file as new_<name>
pub async fn run(opts: ClientOpts, code: Option<u32>) -> Result<(), Box<dyn Error>> {
    let code = match code {
        Some(code) => code,
        None => prompt_transfer_code()?,
    };
    let code = code.to_string();

    debug!("connecting to relay at {}", opts.relay_address);
    let mut client = Client::connect(opts).await?;
    client.exchange_pake().await?;
    client.join(&code, Role::Receiver).await?;
    let mut pipe = client.into_stream();

    debug!("waiting for sender on slot {}", code);
    let key = pipe_pake(&mut pipe, &code).await?;
    debug!("end-to-end key established");

    let mut states = sender_states();
    states.set_start("pake");

    let mut current: Option<(BufWriter<File>, ProgressBar, u64)> = None;
    loop {
        let msg = Message::decode(&framing::read_encrypted_frame(&mut pipe, &key).await?)?;
        if !msg.error.is_empty() {
            return Err(format!("sender reported: {}", msg.error).into());
        }
        states.validate_and_advance(&msg.action)?;

        match msg.action.as_str() {
            "finfo" => {
                let info: FileInfo = msg.bind()?;
                let output = format!("new_{}", info.name);
                debug!("receiving {} ({} bytes) into {}", info.name, info.size, output);

                let bar = ProgressBar::new(info.size);
                bar.set_style(ProgressStyle::default_bar().template(
                    "[{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
                )?);

                let file = File::create(Path::new(&output)).await?;
                current = Some((BufWriter::new(file), bar, 0));
            }
            "file-chunk" => {
                let Some((writer, bar, written)) = current.as_mut() else {
                    return Err("file-chunk before finfo".into());
                };
                writer.write_all(&msg.body).await?;
                *written += msg.body.len() as u64;
                bar.set_position(*written);
            }
            "file-done" => {
                let Some((mut writer, bar, written)) = current.take() else {
                    return Err("file-done before finfo".into());
                };
                writer.flush().await?;
                bar.finish_and_clear();
                println!("File saved ({} bytes)", written);
            }
            "done" => {
                let goodbye: Goodbye = msg.bind()?;
                debug!("sender finished: {}", goodbye.reason);
                break;
            }
            other => {
                // The graph admits nothing else, so this is unreachable in a
                // well-behaved session.
                return Err(format!("unexpected action: {}", other).into());
            }
        }
    }

    println!("Transfer complete!");
    Ok(())
}
