use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression as GzCompression;
use parking_lot::Mutex;
use signalpipe_core::{LogRecord, Serializer, SerializerPolicy};

use crate::error::{Error, Result};
use crate::sink::{Sink, SinkCommon, SinkStats};

const ALLOWED_EXTENSIONS: [&str; 3] = ["log", "txt", "json"];
const DISALLOWED_CHARS: [char; 6] = ['<', '>', ':', '"', '|', '?'];

/// Rejects the forms of path input the design notes call out as "security
/// boundary" concerns: null bytes, `..` escapes, paths outside an
/// allow-list of base directories, and disallowed extensions/characters.
/// Runs unconditionally — there is no "trusted caller" bypass.
pub fn validate_path(path: &Path) -> Result<PathBuf> {
    let raw = path.to_string_lossy();
    if raw.contains('\0') {
        return Err(Error::security("path contains a null byte"));
    }
    if raw.starts_with("\\\\") || raw.starts_with("//?/") {
        return Err(Error::security("UNC/device paths are not allowed"));
    }
    if raw.contains('*') || DISALLOWED_CHARS.iter().any(|c| raw.contains(*c)) {
        return Err(Error::security("path contains a disallowed character"));
    }

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some(ext) if ALLOWED_EXTENSIONS.contains(&ext) => {}
        _ => return Err(Error::security("file extension is not on the allow-list")),
    }

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| Error::security(format!("cannot resolve current directory: {e}")))?
            .join(path)
    };
    let normalized = lexically_normalize(&absolute)
        .ok_or_else(|| Error::security("path escapes its root via `..`"))?;

    let allowed_bases = allow_listed_base_dirs();
    if !allowed_bases
        .iter()
        .any(|base| normalized.starts_with(base))
    {
        return Err(Error::security(
            "path is outside the allow-listed base directories",
        ));
    }

    Ok(normalized)
}

fn lexically_normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}

fn allow_listed_base_dirs() -> Vec<PathBuf> {
    let mut bases = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        if let Some(n) = lexically_normalize(&cwd) {
            bases.push(n);
        }
    }
    let tmp = std::env::temp_dir();
    if let Some(n) = lexically_normalize(&tmp) {
        bases.push(n);
    }
    bases.push(PathBuf::from("/var/log"));
    bases
}

struct RotationState {
    file: BufWriter<File>,
    current_size: u64,
    next_index: u64,
}

pub struct FileSink {
    common: SinkCommon,
    path: PathBuf,
    max_size: u64,
    keep: usize,
    compress: bool,
    serializer: Mutex<Serializer>,
    policy: SerializerPolicy,
    state: Mutex<RotationState>,
}

impl FileSink {
    pub fn open(path: impl AsRef<Path>, max_size: u64, keep: usize, compress: bool) -> Result<Arc<Self>> {
        let path = validate_path(path.as_ref())?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::configuration(format!("cannot create log directory: {e}")))?;
        }
        let file = open_append(&path)?;
        let current_size = file.metadata().map(|m| m.len()).unwrap_or(0);
        let next_index = next_rotation_index(&path);

        let sink = Arc::new(Self {
            common: SinkCommon::default(),
            path,
            max_size,
            keep,
            compress,
            serializer: Mutex::new(Serializer::default()),
            policy: SerializerPolicy::default(),
            state: Mutex::new(RotationState {
                file: BufWriter::new(file),
                current_size,
                next_index,
            }),
        });
        sink.common.mark_active();
        Ok(sink)
    }

    fn write_line(&self, line: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let needed = line.len() as u64 + 1;
        if state.current_size + needed > self.max_size && state.current_size > 0 {
            self.rotate(&mut state)?;
        }
        state
            .file
            .write_all(line)
            .and_then(|_| state.file.write_all(b"\n"))
            .map_err(|e| Error::transport("file", e.to_string()))?;
        let _ = state.file.flush();
        state.current_size += needed;
        Ok(())
    }

    fn rotate(&self, state: &mut RotationState) -> Result<()> {
        state
            .file
            .flush()
            .map_err(|e| Error::transport("file", e.to_string()))?;

        let index = state.next_index;
        state.next_index += 1;
        let rotated_plain = rotated_path(&self.path, index, false);
        fs::rename(&self.path, &rotated_plain)
            .map_err(|e| Error::transport("file", format!("rotate rename failed: {e}")))?;

        if self.compress {
            gzip_and_remove(&rotated_plain, &rotated_path(&self.path, index, true))?;
        }

        prune_old_rotations(&self.path, self.keep);

        let fresh = open_append(&self.path)?;
        state.file = BufWriter::new(fresh);
        state.current_size = 0;
        tracing::info!(path = %self.path.display(), index, "rotated log file");
        metrics::counter!("signalpipe_file_sink_rotations_total").increment(1);
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::configuration(format!("cannot open log file {}: {e}", path.display())))
}

fn rotated_path(base: &Path, index: u64, gzipped: bool) -> PathBuf {
    let stem = base.file_stem().and_then(|s| s.to_str()).unwrap_or("app");
    let ext = base.extension().and_then(|s| s.to_str()).unwrap_or("log");
    let file_name = if gzipped {
        format!("{stem}.{index}.{ext}.gz")
    } else {
        format!("{stem}.{index}.{ext}")
    };
    base.with_file_name(file_name)
}

fn next_rotation_index(base: &Path) -> u64 {
    let dir = match base.parent() {
        Some(p) => p,
        None => return 0,
    };
    let stem = base.file_stem().and_then(|s| s.to_str()).unwrap_or("app");
    let mut max_seen: Option<u64> = None;
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            if let Some(n) = parse_rotation_index(&entry.file_name().to_string_lossy(), stem) {
                max_seen = Some(max_seen.map_or(n, |m| m.max(n)));
            }
        }
    }
    max_seen.map_or(1, |n| n + 1)
}

fn parse_rotation_index(file_name: &str, stem: &str) -> Option<u64> {
    let rest = file_name.strip_prefix(stem)?.strip_prefix('.')?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

fn gzip_and_remove(plain: &Path, gz_target: &Path) -> Result<()> {
    let input = fs::read(plain).map_err(|e| Error::transport("file", e.to_string()))?;
    let out = File::create(gz_target).map_err(|e| Error::transport("file", e.to_string()))?;
    let mut encoder = GzEncoder::new(out, GzCompression::default());
    encoder
        .write_all(&input)
        .and_then(|_| encoder.finish().map(|_| ()))
        .map_err(|e| Error::transport("file", e.to_string()))?;
    let _ = fs::remove_file(plain);
    Ok(())
}

fn prune_old_rotations(base: &Path, keep: usize) {
    let dir = match base.parent() {
        Some(p) => p,
        None => return,
    };
    let stem = base.file_stem().and_then(|s| s.to_str()).unwrap_or("app");
    let mut indices: Vec<(u64, PathBuf)> = Vec::new();
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(n) = parse_rotation_index(&name, stem) {
                indices.push((n, entry.path()));
            }
        }
    }
    indices.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, path) in indices.into_iter().skip(keep) {
        let _ = fs::remove_file(path);
    }
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    fn write(&self, record: Arc<LogRecord>) -> Result<()> {
        let line = self.serializer.lock().serialize(&record, &self.policy);
        self.write_line(&line)
    }

    fn healthy(&self) -> bool {
        self.common.is_healthy()
    }

    fn stats(&self) -> SinkStats {
        self.common.snapshot(0)
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        let _ = state.file.flush();
        Ok(())
    }
}
