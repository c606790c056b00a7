use std::future::Future;
use std::io::Write;
use std::pin::Pin;

use encoder_api::{Cipher, CollaboratorError, Component};

/// age (X25519) encryption: recipient keys are `age1...` public keys and
/// every record becomes a standalone age file only the recipient can open.
#[derive(Debug, Default, Clone, Copy)]
pub struct AgeCipher;

impl AgeCipher {
    pub fn new() -> Self {
        Self
    }
}

fn parse_recipient(key: &str) -> Result<age::x25519::Recipient, CollaboratorError> {
    key.trim()
        .parse::<age::x25519::Recipient>()
        .map_err(|e| CollaboratorError::rejected(format!("invalid age recipient: {e}")))
}

fn seal(recipient: age::x25519::Recipient, plaintext: &[u8]) -> Result<Vec<u8>, CollaboratorError> {
    let encryptor = age::Encryptor::with_recipients(vec![Box::new(recipient)])
        .ok_or_else(|| CollaboratorError::rejected("no valid encryption recipients"))?;

    let mut encrypted = Vec::with_capacity(plaintext.len() + 256);
    let mut writer = encryptor
        .wrap_output(&mut encrypted)
        .map_err(|e| CollaboratorError::internal(format!("age header: {e}")))?;
    writer
        .write_all(plaintext)
        .map_err(|e| CollaboratorError::internal(format!("age payload: {e}")))?;
    writer
        .finish()
        .map_err(|e| CollaboratorError::internal(format!("age finish: {e}")))?;
    Ok(encrypted)
}

impl Component for AgeCipher {
    fn name(&self) -> &str {
        "cipher-age"
    }

    fn start(&self) -> Pin<Box<dyn Future<Output = Result<(), CollaboratorError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }

    fn stop(&self) -> Pin<Box<dyn Future<Output = Result<(), CollaboratorError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}

impl Cipher for AgeCipher {
    fn check_recipient(&self, recipient_key: &str) -> Result<(), CollaboratorError> {
        parse_recipient(recipient_key).map(|_| ())
    }

    fn encrypt(
        &self,
        recipient_key: &str,
        plaintext: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, CollaboratorError>> + Send + '_>> {
        let recipient = parse_recipient(recipient_key);
        Box::pin(async move {
            let recipient = recipient?;
            // X25519 + ChaCha20 over the whole record; keep it off the reactor.
            tokio::task::spawn_blocking(move || seal(recipient, &plaintext))
                .await
                .map_err(|e| CollaboratorError::internal(format!("encrypt task: {e}")))?
        })
    }
}
