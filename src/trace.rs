//! Chrome trace output, enabled with `-d trace`.
//!
//! Load in chrome://tracing or https://ui.perfetto.dev.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Mutex;
use std::time::Instant;

static TRACE: Mutex<Option<Trace>> = Mutex::new(None);

struct Trace {
    start: Instant,
    w: BufWriter<File>,
    count: usize,
}

impl Trace {
    fn new(path: &str) -> std::io::Result<Self> {
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "[")?;
        Ok(Trace {
            start: Instant::now(),
            w,
            count: 0,
        })
    }

    /// A complete ("X") event spanning start..end on track `tid`.
    fn write_complete(
        &mut self,
        name: &str,
        tid: usize,
        start: Instant,
        end: Instant,
    ) -> std::io::Result<()> {
        if self.count > 0 {
            writeln!(self.w, ",")?;
        }
        self.count += 1;
        write!(
            self.w,
            "{{\"pid\": 0, \"tid\": {}, \"name\": {:?}, \"ts\": {}, \"ph\": \"X\", \"dur\": {}}}",
            tid,
            name,
            start.duration_since(self.start).as_micros(),
            end.duration_since(start).as_micros(),
        )
    }

    fn close(&mut self) -> std::io::Result<()> {
        let start = self.start;
        self.write_complete("main", 0, start, Instant::now())?;
        writeln!(self.w, "\n]")?;
        self.w.flush()
    }
}

fn with_trace(f: impl FnOnce(&mut Trace) -> std::io::Result<()>) {
    let mut trace = TRACE.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(t) = trace.as_mut() {
        if let Err(err) = f(t) {
            tracing::warn!("trace: {}", err);
        }
    }
}

pub fn open(path: &str) -> std::io::Result<()> {
    let trace = Trace::new(path)?;
    *TRACE.lock().unwrap_or_else(|e| e.into_inner()) = Some(trace);
    Ok(())
}

pub fn enabled() -> bool {
    TRACE.lock().map(|t| t.is_some()).unwrap_or(false)
}

/// Record a span that was measured elsewhere, such as a task run.
pub fn write_complete(name: &str, tid: usize, start: Instant, end: Instant) {
    with_trace(|t| t.write_complete(name, tid, start, end));
}

/// Run `f`, recording how long it took.
#[inline]
pub fn scope<T>(name: &'static str, f: impl FnOnce() -> T) -> T {
    if !enabled() {
        return f();
    }
    let start = Instant::now();
    let result = f();
    write_complete(name, 0, start, Instant::now());
    result
}

pub fn close() -> std::io::Result<()> {
    let mut trace = TRACE.lock().unwrap_or_else(|e| e.into_inner());
    match trace.take() {
        Some(mut t) => t.close(),
        None => Ok(()),
    }
}
