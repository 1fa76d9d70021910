//! Voice profile registry: name → directory of reference WAV samples.
//!
//! Records live in the `voice_models` SQLite table; the samples themselves live on disk under
//! `<voice_model_dir>/<name>/`. All methods are blocking (file + SQLite I/O); async callers
//! should go through `tokio::task::spawn_blocking`.

use dashmap::DashMap;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use voxchat_voice::{
    audio::extension_of, decode_to_mono_16k, pcm_f32_to_wav, VoiceResult, CANONICAL_EXTENSION,
    CANONICAL_SAMPLE_RATE,
};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("invalid profile name: {0:?}")]
    InvalidName(String),
    #[error("voice model not found: {0}")]
    ProfileNotFound(String),
    #[error("no reference sample for profile: {0}")]
    NoReferenceSample(String),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// One uploaded training file.
#[derive(Debug, Clone)]
pub struct SampleUpload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// One row of `voice_models`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoiceProfile {
    pub name: String,
    pub storage_path: PathBuf,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedSample {
    pub filename: String,
    pub reason: String,
}

/// Outcome of [`VoiceProfileRegistry::register`].
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationReport {
    pub profile: VoiceProfile,
    /// False when the name was already registered.
    pub created: bool,
    pub saved: Vec<PathBuf>,
    pub skipped: Vec<SkippedSample>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Profile names become directory names: reject anything that could escape `voice_model_dir`.
pub fn validate_name(raw: &str) -> Result<String, RegistryError> {
    let name = raw.trim();
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
        || name.chars().any(char::is_control);
    if bad {
        return Err(RegistryError::InvalidName(raw.to_string()));
    }
    Ok(name.to_string())
}

/// File stem reduced to `[A-Za-z0-9_-]`, or "sample" when nothing survives.
fn sample_stem(filename: &str) -> String {
    let base = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("");
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_matches('_');
    if cleaned.is_empty() {
        "sample".to_string()
    } else {
        cleaned.chars().take(64).collect()
    }
}

pub struct VoiceProfileRegistry {
    db_path: PathBuf,
    model_dir: PathBuf,
    write_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl VoiceProfileRegistry {
    /// Open or create the database and ensure the `voice_models` table exists.
    pub fn open(db_path: impl Into<PathBuf>, model_dir: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let this = Self {
            db_path: db_path.into(),
            model_dir: model_dir.into(),
            write_locks: DashMap::new(),
        };
        this.init()?;
        Ok(this)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    fn connect(&self) -> Result<Connection, rusqlite::Error> {
        let conn = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    fn init(&self) -> Result<(), RegistryError> {
        if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::create_dir_all(&self.model_dir)?;
        let conn = self.connect()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS voice_models (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT UNIQUE NOT NULL,
                path TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        self.write_locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Store `samples` under `name` and record the profile if it is new.
    ///
    /// Samples are converted to canonical WAV; ones that fail to decode are skipped, not fatal.
    /// Re-registering an existing name adds samples to its directory and keeps the original
    /// record.
    pub fn register(&self, raw_name: &str, samples: &[SampleUpload]) -> Result<RegistrationReport, RegistryError> {
        let name = validate_name(raw_name)?;
        let lock = self.lock_for(&name);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let existing = self.find(&name)?;
        let dir = match existing {
            Some(ref p) => p.storage_path.clone(),
            None => self.model_dir.join(&name),
        };
        std::fs::create_dir_all(&dir)?;

        let mut next_index = next_sample_index(&dir)?;
        let mut saved = Vec::new();
        let mut skipped = Vec::new();
        for sample in samples {
            let wav = match canonical_wav(sample) {
                Ok(wav) => wav,
                Err(e) => {
                    warn!(target: "voxchat::registry", profile = %name, file = %sample.filename, "Skipping training sample: {}", e);
                    skipped.push(SkippedSample {
                        filename: sample.filename.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            let dest = write_new_sample(&dir, &mut next_index, &sample_stem(&sample.filename), &wav)?;
            saved.push(dest);
        }

        let created = existing.is_none();
        let profile = match existing {
            Some(p) => p,
            None => {
                let conn = self.connect()?;
                conn.execute(
                    "INSERT OR IGNORE INTO voice_models (name, path, created_at_ms) VALUES (?1, ?2, ?3)",
                    params![name, dir.to_string_lossy(), now_ms()],
                )?;
                self.find(&name)?
                    .ok_or_else(|| RegistryError::ProfileNotFound(name.clone()))?
            }
        };

        info!(
            target: "voxchat::registry",
            profile = %name,
            created,
            saved = saved.len(),
            skipped = skipped.len(),
            "Voice profile registered"
        );
        Ok(RegistrationReport {
            profile,
            created,
            saved,
            skipped,
        })
    }

    fn find(&self, name: &str) -> Result<Option<VoiceProfile>, RegistryError> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                "SELECT name, path, created_at_ms FROM voice_models WHERE name = ?1",
                params![name],
                |r| {
                    Ok(VoiceProfile {
                        name: r.get(0)?,
                        storage_path: PathBuf::from(r.get::<_, String>(1)?),
                        created_at_ms: r.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Exact-name lookup.
    pub fn lookup(&self, name: &str) -> Result<VoiceProfile, RegistryError> {
        self.find(name)?
            .ok_or_else(|| RegistryError::ProfileNotFound(name.to_string()))
    }

    /// All registered names, sorted.
    pub fn list_names(&self) -> Result<Vec<String>, RegistryError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT name FROM voice_models ORDER BY name")?;
        let names = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    /// `.wav` files in the profile directory, sorted by file name. A missing directory is empty.
    pub fn reference_samples(&self, profile: &VoiceProfile) -> Result<Vec<PathBuf>, RegistryError> {
        list_wavs(&profile.storage_path)
    }

    pub fn first_reference_sample(&self, profile: &VoiceProfile) -> Result<PathBuf, RegistryError> {
        self.reference_samples(profile)?
            .into_iter()
            .next()
            .ok_or_else(|| RegistryError::NoReferenceSample(profile.name.clone()))
    }
}

fn canonical_wav(sample: &SampleUpload) -> VoiceResult<Vec<u8>> {
    let ext = extension_of(&sample.filename);
    let decoded = decode_to_mono_16k(&sample.bytes, Some(ext.as_str()))?;
    pcm_f32_to_wav(&decoded.samples, CANONICAL_SAMPLE_RATE)
}

/// One past the highest `<n>_` prefix in `dir`, so gaps left by deleted samples are never reused.
fn next_sample_index(dir: &Path) -> Result<u64, RegistryError> {
    let highest = list_wavs(dir)?
        .iter()
        .filter_map(|p| p.file_name()?.to_str()?.split('_').next()?.parse::<u64>().ok())
        .max();
    Ok(highest.map_or(0, |n| n + 1))
}

/// Write `wav` as `<n>_<stem>.wav` with the first free `n >= *next_index`. Existing files are
/// never opened for writing.
fn write_new_sample(dir: &Path, next_index: &mut u64, stem: &str, wav: &[u8]) -> Result<PathBuf, RegistryError> {
    loop {
        let dest = dir.join(format!("{}_{}.{}", next_index, stem, CANONICAL_EXTENSION));
        *next_index += 1;
        let mut file = match std::fs::OpenOptions::new().write(true).create_new(true).open(&dest) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        };
        if let Err(e) = file.write_all(wav).and_then(|_| file.flush()) {
            drop(file);
            let _ = std::fs::remove_file(&dest);
            return Err(e.into());
        }
        return Ok(dest);
    }
}

fn list_wavs(dir: &Path) -> Result<Vec<PathBuf>, RegistryError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut wavs = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_wav = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case(CANONICAL_EXTENSION))
            .unwrap_or(false);
        if is_wav && path.is_file() {
            wavs.push(path);
        }
    }
    wavs.sort();
    Ok(wavs)
}
