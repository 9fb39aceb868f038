use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

use crate::llm::error::LoadError;

/// The magic number that identifies GGUF files ("GGUF" in ASCII)
pub const GGUF_MAGIC: u32 = 0x4655_4747;

/// Rejects files that do not start with the GGUF magic number.
pub fn check_gguf_magic(path: &Path) -> Result<(), LoadError> {
    let mut file = File::open(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => LoadError::NotFound(path.to_path_buf()),
        _ => LoadError::Backend(e.to_string()),
    })?;

    let mut magic = [0u8; 4];
    match file.read_exact(&mut magic) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
            return Err(LoadError::Corrupt {
                path: path.to_path_buf(),
                reason: "file too short for a GGUF header".to_string(),
            });
        }
        Err(e) => return Err(LoadError::Backend(e.to_string())),
    }

    let found = u32::from_le_bytes(magic);
    if found != GGUF_MAGIC {
        return Err(LoadError::Unsupported(format!(
            "{} is not a GGUF file (magic {:#010x})",
            path.display(),
            found
        )));
    }
    Ok(())
}
