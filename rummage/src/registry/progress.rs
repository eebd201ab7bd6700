#[cfg(feature = "progress")]
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Receives byte counts while layer blobs are downloaded.
pub trait FetchProgress: Send + Sync {
    fn begin(&self, digest: &str, total_bytes: u64);
    fn advance(&self, digest: &str, bytes: u64);
    fn finish(&self, digest: &str);
}

pub struct Silent;

impl FetchProgress for Silent {
    fn begin(&self, _digest: &str, _total_bytes: u64) {}
    fn advance(&self, _digest: &str, _bytes: u64) {}
    fn finish(&self, _digest: &str) {}
}

/// One bar per blob, drawn on stderr so stdout only carries the listing.
#[cfg(feature = "progress")]
pub struct BarProgress {
    multi: MultiProgress,
    bars: std::sync::Mutex<std::collections::HashMap<String, ProgressBar>>,
}

#[cfg(feature = "progress")]
impl BarProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::with_draw_target(ProgressDrawTarget::stderr()),
            bars: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn bars(&self) -> std::sync::MutexGuard<'_, std::collections::HashMap<String, ProgressBar>> {
        self.bars.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(feature = "progress")]
impl Default for BarProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "progress")]
impl FetchProgress for BarProgress {
    fn begin(&self, digest: &str, total_bytes: u64) {
        let bar = self.multi.add(ProgressBar::new(total_bytes));
        if let Ok(style) =
            ProgressStyle::default_bar().template("{msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes}")
        {
            bar.set_style(style.progress_chars("=> "));
        }
        let short = digest.split_once(':').map(|(_, hex)| hex).unwrap_or(digest);
        bar.set_message(short[..12.min(short.len())].to_string());
        self.bars().insert(digest.to_string(), bar);
    }

    fn advance(&self, digest: &str, bytes: u64) {
        if let Some(bar) = self.bars().get(digest) {
            bar.inc(bytes);
        }
    }

    fn finish(&self, digest: &str) {
        if let Some(bar) = self.bars().remove(digest) {
            bar.finish_and_clear();
        }
    }
}
