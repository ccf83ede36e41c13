use thiserror::Error;

/// Errors raised while framing or parsing wire messages
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The outer `{"c":..,"m":..}` structure could not be parsed
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The envelope payload is not valid base64 or not valid UTF-8
    #[error("payload decode failure: {0}")]
    DecodeFailure(String),

    /// The decoded payload is not a recognizable application message
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("failed to serialize envelope: {0}")]
    Serialize(String),
}
