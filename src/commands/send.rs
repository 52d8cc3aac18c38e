use std::error::Error;
use std::path::Path;

use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::client::{Client, ClientOpts};
use crate::framing;
use crate::message::{FileInfo, Goodbye, Message, Role};

use super::{generate_transfer_code, pipe_pake};

const CHUNK_SIZE: usize = 64 * 1024;

/// Send a file to whoever presents the same transfer code:
///     - generate (or reuse) a six-digit code to share with the receiver
///     - rendezvous at the relay as the sender half of the code's slot
///     - run the end-to-end key exchange with the receiver through the pipe
///     - announce the file, then stream sealed chunks until done
pub async fn run(
    file_path: &str,
    opts: ClientOpts,
    code: Option<u32>,
) -> Result<(), Box<dyn Error>> {
    let path = Path::new(file_path);
    if !path.is_file() {
        return Err(format!("not a file: {}", file_path).into());
    }

    let code = code.unwrap_or_else(generate_transfer_code);
    println!("Transfer code: \x1b[4m\x1b[1m{}\x1b[0m", code);
    let code = code.to_string();

    debug!("connecting to relay at {}", opts.relay_address);
    let mut client = Client::connect(opts).await?;
    client.exchange_pake().await?;
    client.join(&code, Role::Sender).await?;
    let mut pipe = client.into_stream();

    debug!("waiting for receiver on slot {}", code);
    let key = pipe_pake(&mut pipe, &code).await?;
    debug!("end-to-end key established");

    let mut file = File::open(path).await?;
    let size = file.metadata().await?.len();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_path.to_string());

    let finfo = Message::with_value("finfo", &FileInfo { name, size })?;
    framing::write_encrypted_frame(&mut pipe, &finfo.encode()?, &key).await?;

    let bar = ProgressBar::new(size);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")?,
    );

    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut sent: u64 = 0;
    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }

        let chunk = Message::new("file-chunk", buffer[..n].to_vec());
        framing::write_encrypted_frame(&mut pipe, &chunk.encode()?, &key).await?;
        sent += n as u64;
        bar.set_position(sent);
    }
    bar.finish_and_clear();
    debug!("sent {} bytes in chunks", sent);

    let done = Message::new("file-done", Vec::new());
    framing::write_encrypted_frame(&mut pipe, &done.encode()?, &key).await?;

    let goodbye = Message::with_value(
        "done",
        &Goodbye {
            reason: "transfer complete".to_string(),
        },
    )?;
    framing::write_encrypted_frame(&mut pipe, &goodbye.encode()?, &key).await?;

    println!("Transfer complete!");
    Ok(())
}
