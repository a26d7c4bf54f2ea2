//! Private exponent persistence.
//!
//! The file holds a single decimal integer. It is created on first use with
//! owner-only permissions and is never rewritten afterwards; regenerating it
//! would silently break every peer provisioned against the old public value.

use num_bigint::BigUint;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::Path;
use tracing::{info, warn};

use crate::error::AuthError;
use crate::key_agreement::generate_private_exponent;

/// Read a private exponent. Returns `Ok(None)` if the file does not exist.
pub fn load_private_exponent(path: &Path) -> Result<Option<BigUint>, AuthError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(AuthError::KeyFile {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let digits = content.trim();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AuthError::KeyFileCorrupt {
            path: path.to_path_buf(),
        });
    }

    BigUint::parse_bytes(digits.as_bytes(), 10)
        .map(Some)
        .ok_or_else(|| AuthError::KeyFileCorrupt {
            path: path.to_path_buf(),
        })
}

/// Write a private exponent to a new file. Fails if the file already exists.
pub fn store_private_exponent(path: &Path, private_exponent: &BigUint) -> Result<(), AuthError> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let io_err = |source: std::io::Error| AuthError::KeyFile {
        path: path.to_path_buf(),
        source,
    };

    let mut file = options.open(path).map_err(io_err)?;
    file.write_all(private_exponent.to_str_radix(10).as_bytes())
        .map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    Ok(())
}

/// Load the exponent at `path`, or generate and persist a new one of `bits`
/// bits if the file is absent.
pub fn load_or_create(path: &Path, bits: u64) -> Result<BigUint, AuthError> {
    if let Some(existing) = load_private_exponent(path)? {
        return Ok(existing);
    }

    warn!("Private key file {:?} not found, generating a new key", path);
    let fresh = generate_private_exponent(bits)?;

    match store_private_exponent(path, &fresh) {
        Ok(()) => {
            info!("Wrote new private key to {:?}", path);
            Ok(fresh)
        }
        // Another process created it between our read and write; theirs wins.
        Err(AuthError::KeyFile { source, .. }) if source.kind() == ErrorKind::AlreadyExists => {
            load_private_exponent(path)?.ok_or_else(|| AuthError::KeyFileCorrupt {
                path: path.to_path_buf(),
            })
        }
        Err(e) => Err(e),
    }
}
