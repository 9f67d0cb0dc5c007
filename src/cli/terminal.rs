use std::io::{stderr, Write};
use std::sync::Mutex;
use log::debug;

use crate::device::types::DeviceRecord;
use crate::selector::SelectionSurface;

/// Numbered result listing for a terminal, one based.
pub fn format_result(index: usize, device: &DeviceRecord) -> String {
    let compatible = match device.compatible {
        Some(true) => "robot",
        Some(false) => "not compatible",
        None => "unknown",
    };
    format!("[{}] {} {} ({}, {})", index + 1, device.name, device.identifier, device.transport, compatible)
}

/// Parses a line typed by the user into an index into `results`.
pub fn parse_choice(line: &str, results: &[DeviceRecord]) -> Option<usize> {
    let number: usize = line.trim().parse().ok()?;
    if number == 0 || number > results.len() {
        return None;
    }
    Some(number - 1)
}

#[derive(Default)]
pub struct TerminalSurface {
    title: Mutex<String>,
}

impl SelectionSurface for TerminalSurface {
    fn set_title(&self, title: &str) {
        let mut current = self.title.lock().expect("Failed to lock TerminalSurface");
        if *current == title {
            return;
        }
        *current = title.to_string();

        let mut err = stderr();
        let _ = write!(err, "\r{:<40}", title);
        let _ = err.flush();
    }

    fn set_progress_visible(&self, visible: bool) {
        debug!("progress visible: {}", visible);
    }

    fn show_results(&self, results: &[DeviceRecord]) {
        println!();
        for (index, device) in results.iter().enumerate() {
            println!("{}", format_result(index, device));
        }
    }

    fn notify(&self, message: &str) {
        println!("{}", message);
    }

    fn dismiss(&self) {
        debug!("selection dismissed");
    }
}
