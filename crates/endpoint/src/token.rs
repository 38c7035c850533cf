use rand::Rng;

/// Token length in bytes (32 hex characters).
const TOKEN_BYTES: usize = 16;

/// Generates the random token that namespaces one channel connection's
/// sessions.
pub fn generate_connection_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}
