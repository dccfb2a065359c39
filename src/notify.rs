use anyhow::Result;
use log::info;

use crate::monitor::Notifier;

/// Writes notifications to the log. Desktop delivery is left to whatever
/// tails the log or replaces this notifier.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, message: &str) -> Result<()> {
        info!("[{title}] {message}");
        Ok(())
    }
}
