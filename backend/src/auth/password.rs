use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

#[cfg(not(test))]
pub const PBKDF2_ITERATIONS: u32 = 600_000;
#[cfg(test)]
pub const PBKDF2_ITERATIONS: u32 = 1_000;
const SALT_LENGTH: usize = 16;
const HASH_LENGTH: usize = 32;
const SCHEME: &str = "pbkdf2:sha256";

#[derive(Debug, thiserror::Error)]
pub enum PasswordError {
    #[error("Malformed password hash")]
    Malformed,
}

fn derive(password: &str, salt: &[u8], iterations: u32) -> [u8; HASH_LENGTH] {
    let mut out = [0u8; HASH_LENGTH];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut out);
    out
}

/// `pbkdf2:sha256:<iterations>$<salt hex>$<hash hex>`
pub fn hash_password(password: &str) -> String {
    hash_with_iterations(password, PBKDF2_ITERATIONS)
}

fn hash_with_iterations(password: &str, iterations: u32) -> String {
    let mut salt = [0u8; SALT_LENGTH];
    rand::rng().fill_bytes(&mut salt);
    let hash = derive(password, &salt, iterations);
    format!(
        "{}:{}${}${}",
        SCHEME,
        iterations,
        hex::encode(salt),
        hex::encode(hash)
    )
}

pub fn verify_password(password: &str, stored: &str) -> Result<bool, PasswordError> {
    let rest = stored
        .strip_prefix(SCHEME)
        .and_then(|r| r.strip_prefix(':'))
        .ok_or(PasswordError::Malformed)?;
    let mut parts = rest.split('$');
    let (Some(iterations), Some(salt), Some(expected), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(PasswordError::Malformed);
    };
    let iterations: u32 = iterations.parse().map_err(|_| PasswordError::Malformed)?;
    let salt = hex::decode(salt).map_err(|_| PasswordError::Malformed)?;
    let expected = hex::decode(expected).map_err(|_| PasswordError::Malformed)?;
    if iterations == 0 || expected.len() != HASH_LENGTH {
        return Err(PasswordError::Malformed);
    }
    let actual = derive(password, &salt, iterations);
    Ok(actual[..].ct_eq(&expected[..]).into())
}
