//! Interactive key reader
//!
//! Reads stdin line by line on a dedicated thread; every character that maps
//! to an `Adjustment` is forwarded to the control loop.

use crate::services::control_loop::Adjustment;
use std::io::BufRead;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Adjustments encoded in one line of input, in order
pub fn parse_keys(line: &str) -> Vec<Adjustment> {
    line.chars().filter_map(Adjustment::from_key).collect()
}

/// Forward adjustments read from `input` until EOF, a stop key, or the loop goes away
pub fn forward_keys<R: BufRead>(input: R, adjustments: &mpsc::Sender<Adjustment>) {
    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "console_read_failed");
                return;
            }
        };

        for adjustment in parse_keys(&line) {
            debug!(adjustment = %adjustment.as_str(), "console_key");
            if adjustments.blocking_send(adjustment).is_err() {
                return;
            }
            if adjustment == Adjustment::Stop {
                return;
            }
        }
    }
}

/// Spawn the stdin reader thread
///
/// The thread is detached in practice; a blocked stdin read does not hold up shutdown.
pub fn spawn_console(adjustments: mpsc::Sender<Adjustment>) -> std::io::Result<JoinHandle<()>> {
    info!(keys = "w/W width, -/+ middle, j/k focus, r reset, q quit", "console_started");
    std::thread::Builder::new().name("console".to_string()).spawn(move || {
        let stdin = std::io::stdin();
        forward_keys(stdin.lock(), &adjustments);
        debug!("console_stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_parse_keys() {
        assert_eq!(
            parse_keys("wW x+j"),
            vec![
                Adjustment::WidthDown,
                Adjustment::WidthUp,
                Adjustment::MiddleUp,
                Adjustment::FocusDown
            ]
        );
        assert!(parse_keys("hello").is_empty());
    }

    #[test]
    fn test_forward_stops_at_quit() {
        let (tx, mut rx) = mpsc::channel(16);
        forward_keys(Cursor::new("k\nrq\nW\n"), &tx);

        assert_eq!(rx.try_recv().unwrap(), Adjustment::FocusUp);
        assert_eq!(rx.try_recv().unwrap(), Adjustment::Reset);
        assert_eq!(rx.try_recv().unwrap(), Adjustment::Stop);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_forward_ends_when_loop_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        forward_keys(Cursor::new("wwww\n"), &tx);
    }
}
