use rand::Rng;
use sha2::{Digest, Sha256};
use shared::protocol::{CODE_ALPHABET, CODE_LENGTH, ROUTE_TOKEN_LENGTH};

fn random_token(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..CODE_ALPHABET.len());
            CODE_ALPHABET[idx] as char
        })
        .collect()
}

/// Draws a fresh short code. Uniqueness is enforced by the store, not here.
pub fn generate_code() -> String {
    random_token(CODE_LENGTH)
}

/// Callback path token for a new provider subscription
pub fn generate_route_token() -> String {
    random_token(ROUTE_TOKEN_LENGTH)
}

/// Cheap shape check so obviously mistyped codes never reach the store.
pub fn is_well_formed(code: &str) -> bool {
    code.len() == CODE_LENGTH && code.bytes().all(|b| CODE_ALPHABET.contains(&b))
}

/// Short SHA-256 prefix identifying a credential in logs without revealing it.
pub fn fingerprint(credential: &str) -> String {
    let digest = Sha256::digest(credential.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(12);
    hex
}
