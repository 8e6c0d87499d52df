use std::collections::HashMap;

use crate::models::{Format, QualityOption};

const MAX_OPTIONS: usize = 6;

/// Resolution buckets, highest first: (min height, key, label).
const BUCKETS: [(u32, &str, &str); 6] = [
    (2160, "4K", "4K"),
    (1440, "1440p", "2K"),
    (1080, "1080p", "1080p"),
    (720, "720p", "720p"),
    (480, "480p", "480p"),
    (360, "360p", "360p"),
];

fn bucket_for(height: u32) -> Option<(&'static str, String)> {
    let &(min, key, label) = BUCKETS.iter().find(|(min, _, _)| height >= *min)?;
    let display = if min >= 1440 {
        format!("{} ({}p)", label, height)
    } else {
        label.to_string()
    };
    Some((key, display))
}

fn size_estimate(format: &Format) -> Option<String> {
    let bytes = format.filesize.or(format.filesize_approx).filter(|size| *size > 0)?;
    Some(format!("~{:.1}MB", bytes as f64 / (1024.0 * 1024.0)))
}

fn audio_option() -> QualityOption {
    QualityOption {
        key: "audio".to_string(),
        display_label: "Audio only (MP3)".to_string(),
        size_estimate: None,
        resolution_height: 0,
        format_id: None,
        ext: Some("mp3".to_string()),
    }
}

/// Groups formats into resolution buckets, keeping the highest-bitrate
/// representative of each, then appends the audio-only choice.
pub fn analyze_formats(formats: &[Format]) -> Vec<QualityOption> {
    let mut best: HashMap<&'static str, (f64, QualityOption)> = HashMap::new();

    for format in formats {
        let Some(height) = format.height else { continue };
        let Some((key, display)) = bucket_for(height) else { continue };
        let tbr = format.tbr.unwrap_or(0.0);

        let replace = match best.get(key) {
            Some((current, _)) => tbr > *current,
            None => true,
        };
        if replace {
            best.insert(
                key,
                (
                    tbr,
                    QualityOption {
                        key: key.to_string(),
                        display_label: display,
                        size_estimate: size_estimate(format),
                        resolution_height: height,
                        format_id: Some(format.format_id.clone()),
                        ext: Some(format.ext.clone()),
                    },
                ),
            );
        }
    }

    let mut options: Vec<QualityOption> = best.into_values().map(|(_, option)| option).collect();
    options.sort_by(|a, b| b.resolution_height.cmp(&a.resolution_height));
    options.push(audio_option());
    options.truncate(MAX_OPTIONS);
    options
}
