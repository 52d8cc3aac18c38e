pub mod discover;
pub mod receive;
pub mod relay;
pub mod send;

use rand::Rng;
use tokio::net::TcpStream;

use crate::error::Error;
use crate::framing;
use crate::message::{Message, Pake};
use crate::{crypto, KEY_SIZE};

/// Identity both endpoints use for the end-to-end exchange over the pipe.
const TRANSFER_IDENTITY: &str = "skiff-transfer";

/// Generate a random six-digit transfer code to share with the receiver.
pub fn generate_transfer_code() -> u32 {
    let mut rng = rand::thread_rng();
    rng.gen_range(100_000..=999_999)
}

/// Prompt until the user enters a valid six-digit transfer code.
pub fn prompt_transfer_code() -> Result<u32, Error> {
    loop {
        println!("Enter 6-digit transfer code:");
        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;

        let trimmed = input.trim();
        if trimmed.len() == 6 && trimmed.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(code) = trimmed.parse::<u32>() {
                return Ok(code);
            }
        }
        println!("Please enter exactly 6 digits.");
    }
}

/// Run the symmetric PAKE with the peer through the paired pipe, using the
/// transfer code as the password. Both sides write their start message first
/// and then read the other's, so neither blocks the exchange.
pub(crate) async fn pipe_pake(
    pipe: &mut TcpStream,
    password: &str,
) -> Result<[u8; KEY_SIZE], Error> {
    let (spake, outbound) = crypto::start_pake(password, TRANSFER_IDENTITY);

    let msg = Message::with_value("pake", &Pake { body: outbound })?;
    framing::write_frame(pipe, &msg.encode()?).await?;

    let reply = Message::decode(&framing::read_frame(pipe).await?)?;
    if !reply.error.is_empty() {
        return Err(Error::Remote(reply.error));
    }
    if reply.action != "pake" {
        return Err(Error::UnexpectedAction {
            expected: "pake".to_string(),
            got: reply.action,
        });
    }

    let peer: Pake = reply.bind()?;
    crypto::finish_pake(spake, &peer.body)
}
