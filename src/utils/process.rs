//! Child process helpers

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::thread::JoinHandle;

/// Stderr lines kept for error reports
pub const STDERR_TAIL: usize = 5;

/// Read `reader` to the end, keeping only the last `limit` lines
pub fn tail_lines<R: BufRead>(reader: R, limit: usize) -> VecDeque<String> {
    let mut tail = VecDeque::with_capacity(limit);
    for line in reader.lines() {
        let Ok(line) = line else {
            break;
        };
        if limit == 0 {
            continue;
        }
        if tail.len() == limit {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail
}

/// Drains a child's stderr on its own thread so a chatty child never stalls
/// on a full pipe. The last lines are kept for error reports.
pub struct StderrTail {
    handle: Option<JoinHandle<VecDeque<String>>>,
}

impl StderrTail {
    pub fn spawn<R>(stderr: Option<R>, label: &str) -> std::io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        let handle = match stderr {
            Some(stderr) => Some(
                std::thread::Builder::new()
                    .name(format!("{}-stderr", label))
                    .spawn(move || tail_lines(BufReader::new(stderr), STDERR_TAIL))?,
            ),
            None => None,
        };
        Ok(Self { handle })
    }

    /// Wait for the pipe to close and return the kept lines joined
    pub fn collect(mut self) -> String {
        match self.handle.take().map(|h| h.join()) {
            Some(Ok(tail)) => tail.into_iter().collect::<Vec<_>>().join(" | "),
            Some(Err(_)) => {
                tracing::warn!("Stderr reader thread panicked");
                String::new()
            }
            None => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_tail_keeps_last_lines() {
        let text: String = (0..10_000).map(|n| format!("line {}\n", n)).collect();
        let tail = tail_lines(Cursor::new(text), STDERR_TAIL);
        assert_eq!(
            tail.into_iter().collect::<Vec<_>>(),
            vec!["line 9995", "line 9996", "line 9997", "line 9998", "line 9999"]
        );
    }

    #[test]
    fn test_tail_of_short_output() {
        let tail = tail_lines(Cursor::new("only\n"), STDERR_TAIL);
        assert_eq!(tail, VecDeque::from(vec!["only".to_string()]));
        assert!(tail_lines(Cursor::new(""), STDERR_TAIL).is_empty());
    }

    #[test]
    fn test_drains_large_output_before_collect() {
        // Far more than a pipe buffer holds
        let text: String = (0..50_000).map(|n| format!("warning {}\n", n)).collect();
        let tail = StderrTail::spawn(Some(Cursor::new(text.into_bytes())), "test").unwrap();
        assert_eq!(
            tail.collect(),
            "warning 49995 | warning 49996 | warning 49997 | warning 49998 | warning 49999"
        );
        assert_eq!(StderrTail::spawn(None::<Cursor<Vec<u8>>>, "none").unwrap().collect(), "");
    }
}
