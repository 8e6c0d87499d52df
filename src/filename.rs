//! Turns titles into collision-free output filenames.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use walkdir::WalkDir;

/// Prefix of task-scoped working files inside the output directory.
pub const WORKING_PREFIX: &str = "temp_";

/// Bytes held back from the title for a ` (NN)` or `_xxxxxxxx` suffix.
const SUFFIX_RESERVE: usize = 12;
const MAX_NUMBERED: u32 = 99;
const FALLBACK_NAME: &str = "video";

/// Working-file stem for a task; unique per task id.
pub fn working_stem(task_id: &str) -> String {
    format!("{}{}", WORKING_PREFIX, task_id)
}

pub fn is_working_file(name: &str) -> bool {
    name.starts_with(WORKING_PREFIX)
}

fn is_partial(name: &str) -> bool {
    name.ends_with(".part") || name.ends_with(".ytdl") || name.contains(".part-Frag") || name.ends_with(".temp")
}

fn working_entries(dir: &Path, task_id: &str) -> impl Iterator<Item = walkdir::DirEntry> {
    let prefix = format!("{}.", working_stem(task_id));
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(move |entry| {
            entry.file_type().is_file() && entry.file_name().to_string_lossy().starts_with(&prefix)
        })
}

/// Largest finished working file of a task, with its size.
pub fn find_working_file(dir: &Path, task_id: &str) -> Option<(PathBuf, u64)> {
    working_entries(dir, task_id)
        .filter(|entry| !is_partial(&entry.file_name().to_string_lossy()))
        .filter_map(|entry| {
            let size = entry.metadata().ok()?.len();
            Some((entry.into_path(), size))
        })
        .max_by_key(|(_, size)| *size)
}

/// Deletes every working file and fragment a task left in `dir`.
pub fn remove_working_files(dir: &Path, task_id: &str) -> usize {
    let mut removed = 0;
    for entry in working_entries(dir, task_id) {
        match std::fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!(task_id = %task_id, "Could not remove {}: {}", entry.path().display(), e),
        }
    }
    removed
}

/// Strips characters illegal on common filesystems and collapses whitespace.
pub fn sanitize_title(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') && !c.is_control())
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.trim_end_matches(['.', ' ']).to_string()
}

fn has_cjk(text: &str) -> bool {
    text.chars().any(|c| ('\u{4e00}'..='\u{9fff}').contains(&c) || ('\u{3040}'..='\u{30ff}').contains(&c) || ('\u{ac00}'..='\u{d7af}').contains(&c))
}

/// Cuts `name` to at most `max_bytes`, never inside a UTF-8 sequence, and
/// backs off to the last word boundary for space-separated scripts.
pub fn truncate_title(name: &str, max_bytes: usize) -> String {
    if name.len() <= max_bytes {
        return name.to_string();
    }

    let mut end = max_bytes;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = &name[..end];

    let cut_mid_word = name[end..].chars().next().is_some_and(|c| !c.is_whitespace());
    if cut_mid_word && !has_cjk(truncated) {
        if let Some(space) = truncated.rfind(char::is_whitespace) {
            truncated = &truncated[..space];
        }
    }

    truncated.trim_end_matches([' ', '-', '_']).to_string()
}

fn join_ext(stem: &str, extension: &str) -> String {
    if extension.is_empty() {
        stem.to_string()
    } else {
        format!("{}.{}", stem, extension)
    }
}

/// Picks a free filename for `title` in `target_dir`.
///
/// Tries `title.ext`, then `title (2).ext` through `title (99).ext`, then
/// falls back to an 8-character random suffix.
pub fn resolve(title: &str, extension: &str, target_dir: &Path, max_length: usize) -> String {
    let mut base = sanitize_title(title);
    let budget = max_length
        .saturating_sub(extension.len() + 1)
        .saturating_sub(SUFFIX_RESERVE);
    if base.len() > budget {
        let truncated = truncate_title(&base, budget);
        tracing::info!("Title too long, truncated: '{}' -> '{}'", title, truncated);
        base = truncated;
    }
    if base.is_empty() {
        base = FALLBACK_NAME.to_string();
    }

    let candidate = join_ext(&base, extension);
    if !target_dir.join(&candidate).exists() {
        return candidate;
    }

    for n in 2..=MAX_NUMBERED {
        let numbered = join_ext(&format!("{} ({})", base, n), extension);
        if !target_dir.join(&numbered).exists() {
            return numbered;
        }
    }

    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let fallback = join_ext(&format!("{}_{}", base, &suffix[..8]), extension);
    tracing::info!("Numbered names exhausted for '{}', using '{}'", base, fallback);
    fallback
}

/// Resolves and applies final names, one directory at a time.
///
/// The existence check and the rename happen under a per-directory lock so
/// two tasks finishing together never claim the same name.
pub struct FilenameResolver {
    max_length: usize,
    dir_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl FilenameResolver {
    pub fn new(max_length: usize) -> Self {
        FilenameResolver {
            max_length,
            dir_locks: Mutex::new(HashMap::new()),
        }
    }

    fn dir_lock(&self, dir: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.dir_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(dir.to_path_buf()).or_default().clone()
    }

    /// Renames `working` to a name derived from `title`.
    ///
    /// A failed rename keeps the working file; the download itself succeeded.
    pub fn finalize(&self, working: &Path, title: &str) -> PathBuf {
        let Some(dir) = working.parent() else {
            return working.to_path_buf();
        };
        let extension = working
            .extension()
            .map(|ext| ext.to_string_lossy().to_string())
            .unwrap_or_default();

        let lock = self.dir_lock(dir);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let name = resolve(title, &extension, dir, self.max_length);
        let target = dir.join(&name);
        match std::fs::rename(working, &target) {
            Ok(()) => {
                tracing::info!(
                    "Renamed working file {} -> {}",
                    working.display(),
                    name
                );
                target
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to rename {} to {}: {}; keeping working name",
                    working.display(),
                    name,
                    e
                );
                working.to_path_buf()
            }
        }
    }
}
