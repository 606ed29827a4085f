/*
 * Copyright 2023 Michael Krolikowski
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Atomic temp-file-then-rename JSON persistence. Reads are best-effort: a
//! missing or corrupt file yields the type's default and logs a warning;
//! the next write repairs it.

use std::fs;
use std::path::Path;

use serde::{Serialize, de::DeserializeOwned};

pub fn read_json_or_default<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    match fs::read(path) {
        Ok(bytes) if bytes.is_empty() => T::default(),
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(e) => {
                log::warn!(
                    "{} is present but could not be parsed ({e}); using default",
                    path.display()
                );
                T::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => T::default(),
        Err(e) => {
            log::warn!("failed to read {}: {e}; using default", path.display());
            T::default()
        }
    }
}

pub fn write_json_atomic<T>(path: &Path, value: &T) -> std::io::Result<()>
where
    T: Serialize,
{
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let tmp_path = dir.join(format!(
        ".{}.tmp",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("autoheal")
    ));
    let bytes = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp_path, bytes)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Doc {
        value: u32,
    }

    #[test]
    fn round_trips_through_atomic_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");
        write_json_atomic(&path, &Doc { value: 42 }).unwrap();
        let loaded: Doc = read_json_or_default(&path);
        assert_eq!(loaded, Doc { value: 42 });
    }

    #[test]
    fn missing_file_yields_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let loaded: Doc = read_json_or_default(&path);
        assert_eq!(loaded, Doc::default());
    }

    #[test]
    fn corrupt_file_yields_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("corrupt.json");
        fs::write(&path, b"{not valid json").unwrap();
        let loaded: Doc = read_json_or_default(&path);
        assert_eq!(loaded, Doc::default());
    }
}
