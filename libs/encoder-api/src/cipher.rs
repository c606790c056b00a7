use std::future::Future;
use std::pin::Pin;

use crate::component::Component;
use crate::error::CollaboratorError;

/// Recipient-keyed encryption.
///
/// The key format is owned by the implementation; the engine treats keys
/// as opaque strings.
pub trait Cipher: Component {
    /// Validate a recipient key without encrypting anything.
    /// `Rejected` if the key is malformed.
    fn check_recipient(&self, recipient_key: &str) -> Result<(), CollaboratorError>;

    /// Encrypt `plaintext` so that only the holder of the recipient's
    /// private key can read it.
    fn encrypt(
        &self,
        recipient_key: &str,
        plaintext: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, CollaboratorError>> + Send + '_>>;
}
