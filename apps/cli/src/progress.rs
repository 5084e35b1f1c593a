use std::sync::Mutex;
use std::time::Duration;

use edl_core::events::{EdlEvent, EdlObserver, TracingObserver};
use indicatif::{ProgressBar, ProgressStyle};

/// Draws one progress bar per operation and logs everything else.
pub struct BarObserver {
    current: Mutex<Option<(String, ProgressBar)>>,
    fallback: TracingObserver,
}

impl BarObserver {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
            fallback: TracingObserver,
        }
    }

    fn style() -> ProgressStyle {
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-")
    }

    fn update(&self, operation: &str, current: u64, total: u64) {
        let Ok(mut slot) = self.current.lock() else {
            return;
        };
        let same = matches!(&*slot, Some((op, _)) if op == operation);
        if !same {
            if let Some((_, bar)) = slot.take() {
                bar.finish();
            }
            let bar = ProgressBar::new(total);
            bar.set_style(Self::style());
            bar.set_message(operation.to_string());
            bar.enable_steady_tick(Duration::from_millis(120));
            *slot = Some((operation.to_string(), bar));
        }
        if let Some((_, bar)) = slot.as_ref() {
            bar.set_length(total);
            bar.set_position(current);
        }
    }

    /// Finish the active bar, if any.
    pub fn finish(&self) {
        if let Ok(mut slot) = self.current.lock()
            && let Some((_, bar)) = slot.take()
        {
            bar.finish();
        }
    }
}

impl EdlObserver for BarObserver {
    fn on_event(&self, event: &EdlEvent) {
        match event {
            EdlEvent::Progress {
                operation,
                current,
                total,
            } => self.update(operation, *current, *total),
            EdlEvent::Complete | EdlEvent::Error { .. } => {
                self.finish();
                self.fallback.on_event(event);
            }
            other => {
                let suspended = self.current.lock().ok().and_then(|s| s.as_ref().map(|(_, b)| b.clone()));
                match suspended {
                    Some(bar) => bar.suspend(|| self.fallback.on_event(other)),
                    None => self.fallback.on_event(other),
                }
            }
        }
    }
}
