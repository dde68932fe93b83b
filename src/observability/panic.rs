//! Stack traces for panics and reported errors
//!
//! A process-wide panic hook records the message, location and a backtrace of
//! every panic raised inside a captured request into a thread-local slot. The
//! capture interceptor takes the report after `catch_unwind` returns on the
//! same thread. The previously installed hook still runs.

use crate::observability::context::RequestContext;
use crate::observability::model::StackFrame;
use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::cell::RefCell;
use std::panic::Location;
use std::sync::Once;

/// What the hook saw for one panic
#[derive(Debug, Clone)]
pub struct PanicReport {
    pub message: String,
    pub frames: Vec<StackFrame>,
}

thread_local! {
    static LAST_PANIC: RefCell<Option<PanicReport>> = const { RefCell::new(None) };
}

static INSTALL: Once = Once::new();

/// Install the panic hook (idempotent)
pub fn install_panic_hook() {
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if RequestContext::current().is_some() {
                let fallback = info.location().map(|location| StackFrame {
                    function: "<panic>".to_string(),
                    file: Some(location.file().to_string()),
                    line: Some(location.line()),
                });
                let report = PanicReport {
                    message: panic_message(info.payload()),
                    frames: frames_or(Backtrace::force_capture(), fallback),
                };
                LAST_PANIC.with(|slot| *slot.borrow_mut() = Some(report));
            }
            previous(info);
        }));
    });
}

/// Take the report of the most recent panic on this thread
pub(crate) fn take_panic_report() -> Option<PanicReport> {
    LAST_PANIC.with(|slot| slot.borrow_mut().take())
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

/// Frames of the current call stack, falling back to `location`
pub(crate) fn capture_frames(location: &Location<'_>) -> Vec<StackFrame> {
    frames_or(
        Backtrace::force_capture(),
        Some(StackFrame {
            function: "<unknown>".to_string(),
            file: Some(location.file().to_string()),
            line: Some(location.line()),
        }),
    )
}

fn frames_or(backtrace: Backtrace, fallback: Option<StackFrame>) -> Vec<StackFrame> {
    let frames = if backtrace.status() == BacktraceStatus::Captured {
        trim_capture_frames(parse_backtrace(&backtrace.to_string()))
    } else {
        Vec::new()
    };

    if frames.is_empty() {
        vec![fallback.unwrap_or_else(|| StackFrame {
            function: "<unknown>".to_string(),
            file: None,
            line: None,
        })]
    } else {
        frames
    }
}

/// Parse `std::backtrace::Backtrace` display output into frames.
///
/// The format is one `N: function` line per frame, optionally followed by an
/// `at file:line:column` line.
pub fn parse_backtrace(text: &str) -> Vec<StackFrame> {
    let mut frames: Vec<StackFrame> = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(location) = trimmed.strip_prefix("at ") {
            if let Some(frame) = frames.last_mut() {
                if frame.file.is_none() {
                    let (file, line) = split_location(location);
                    frame.file = Some(file);
                    frame.line = line;
                }
            }
            continue;
        }

        if let Some((index, function)) = trimmed.split_once(": ") {
            if !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()) {
                frames.push(StackFrame {
                    function: function.trim().to_string(),
                    file: None,
                    line: None,
                });
            }
        }
    }

    frames
}

/// `src/main.rs:10:5` -> (`src/main.rs`, Some(10))
fn split_location(location: &str) -> (String, Option<u32>) {
    let mut parts = location.rsplitn(3, ':');
    let last = parts.next();
    let middle = parts.next();
    let rest = parts.next();

    match (rest, middle, last) {
        (Some(file), Some(line), Some(col))
            if line.parse::<u32>().is_ok() && col.parse::<u32>().is_ok() =>
        {
            (file.to_string(), line.parse().ok())
        }
        (_, Some(file), Some(line)) if line.parse::<u32>().is_ok() => {
            let file = match rest {
                Some(rest) => format!("{}:{}", rest, file),
                None => file.to_string(),
            };
            (file, line.parse().ok())
        }
        _ => (location.to_string(), None),
    }
}

const CAPTURE_MACHINERY: &[&str] = &[
    "std::backtrace",
    "std::panicking",
    "std::panic::",
    "core::panicking",
    "rust_begin_unwind",
    "__rustc::rust_begin_unwind",
    "<alloc::boxed::Box<F,A> as core::ops::function::Fn<Args>>::call",
    "request_lens::observability::panic::",
];

/// Drop the leading frames that belong to backtrace capture and panic dispatch
fn trim_capture_frames(frames: Vec<StackFrame>) -> Vec<StackFrame> {
    let skip = frames
        .iter()
        .take_while(|frame| {
            CAPTURE_MACHINERY
                .iter()
                .any(|prefix| frame.function.starts_with(prefix))
        })
        .count();

    if skip == frames.len() {
        frames
    } else {
        frames.into_iter().skip(skip).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "   0: std::backtrace::Backtrace::force_capture
             at /rustc/abc/library/std/src/backtrace.rs:312:13
   1: request_lens::observability::panic::capture_frames
             at ./src/observability/panic.rs:70:9
   2: demo::handlers::create_user
             at ./src/handlers/demo.rs:42:5
   3: tokio::runtime::task::core::Core<T,S>::poll
   4: main
             at ./src/main.rs:7:1";

    #[test]
    fn test_parse_backtrace() {
        let frames = parse_backtrace(SAMPLE);
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[2].function, "demo::handlers::create_user");
        assert_eq!(frames[2].file.as_deref(), Some("./src/handlers/demo.rs"));
        assert_eq!(frames[2].line, Some(42));
        assert_eq!(frames[3].file, None);
    }

    #[test]
    fn test_capture_machinery_trimmed() {
        let frames = trim_capture_frames(parse_backtrace(SAMPLE));
        assert_eq!(frames[0].function, "demo::handlers::create_user");
        assert_eq!(frames.len(), 3);
    }

    #[test]
    fn test_split_location_variants() {
        assert_eq!(split_location("src/a.rs:10:5"), ("src/a.rs".to_string(), Some(10)));
        assert_eq!(split_location("src/a.rs:10"), ("src/a.rs".to_string(), Some(10)));
        assert_eq!(split_location("C:\\src\\a.rs:10:5"), ("C:\\src\\a.rs".to_string(), Some(10)));
        assert_eq!(split_location("<unknown>"), ("<unknown>".to_string(), None));
    }

    #[test]
    fn test_capture_frames_never_empty() {
        let frames = capture_frames(Location::caller());
        assert!(!frames.is_empty());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(payload.as_ref()), "static message");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "Box<dyn Any>");
    }

    #[tokio::test]
    async fn test_hook_records_panics_inside_requests_only() {
        install_panic_hook();

        let outside = std::panic::catch_unwind(|| panic!("outside"));
        assert!(outside.is_err());
        assert!(take_panic_report().is_none());

        let ctx = RequestContext::new("GET", "/boom");
        let report = ctx
            .scope(async {
                let result = std::panic::catch_unwind(|| panic!("inside {}", 1));
                assert!(result.is_err());
                take_panic_report()
            })
            .await
            .unwrap();

        assert_eq!(report.message, "inside 1");
        assert!(!report.frames.is_empty());
    }
}
