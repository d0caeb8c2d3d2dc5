// src/resolve.rs
use memmap2::Mmap;
use std::fs::{File, Metadata};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Upper bound on a resolved filesystem path, including its terminator slot.
pub const FILENAME_LEN: usize = 200;

/// Outcome of resolving a request target under the document root.
pub enum Resolution {
    File(MappedFile),
    NotFound,
    Forbidden,
    Directory,
    Error,
}

/// A resolved regular file and its read-only mapping.
///
/// Zero-length files carry no mapping at all; their response is headers-only.
pub struct MappedFile {
    path: PathBuf,
    len: usize,
    map: Option<Mmap>,
}

impl MappedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_mapped(&self) -> bool {
        self.map.is_some()
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        self.map.as_deref()
    }

    /// Release the mapping. Idempotent.
    pub fn unmap(&mut self) {
        self.map = None;
    }
}

/// Map a request path onto a readable regular file under `doc_root`.
pub fn resolve(doc_root: &Path, url_path: &str) -> Resolution {
    if escapes_root(url_path) {
        return Resolution::Forbidden;
    }

    let real_path = join_capped(doc_root, url_path);
    let meta = match std::fs::metadata(&real_path) {
        Ok(m) => m,
        Err(_) => return Resolution::NotFound,
    };
    if meta.permissions().mode() & 0o004 == 0 {
        return Resolution::Forbidden;
    }
    if meta.is_dir() {
        return Resolution::Directory;
    }

    match map_file(&real_path, &meta) {
        Ok(file) => Resolution::File(file),
        Err(e) => {
            warn!(path = %real_path.display(), error = %e, "failed to map resource");
            Resolution::Error
        }
    }
}

fn map_file(path: &Path, meta: &Metadata) -> io::Result<MappedFile> {
    let len = meta.len() as usize;
    if len == 0 {
        return Ok(MappedFile {
            path: path.to_owned(),
            len: 0,
            map: None,
        });
    }
    let file = File::open(path)?;
    // The mapping outlives the descriptor; `file` closes on drop.
    let map = unsafe { Mmap::map(&file)? };
    Ok(MappedFile {
        path: path.to_owned(),
        len,
        map: Some(map),
    })
}

/// True when the dot-dot segments of `url_path` would climb above the root.
fn escapes_root(url_path: &str) -> bool {
    let mut depth: i32 = 0;
    for segment in url_path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                depth -= 1;
                if depth < 0 {
                    return true;
                }
            }
            _ => depth += 1,
        }
    }
    false
}

/// Join root and target, truncating the target to keep the whole path under
/// `FILENAME_LEN` bytes (one slot is reserved for a terminator).
fn join_capped(doc_root: &Path, url_path: &str) -> PathBuf {
    let root_len = doc_root.as_os_str().as_bytes().len();
    let room = FILENAME_LEN.saturating_sub(1).saturating_sub(root_len);

    let mut tail = url_path;
    if tail.len() > room {
        let mut cut = room;
        while cut > 0 && !tail.is_char_boundary(cut) {
            cut -= 1;
        }
        tail = &tail[..cut];
    }

    let mut path = doc_root.as_os_str().to_os_string();
    path.push(tail);
    PathBuf::from(path)
}
