use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;

/// Tracing layer appending one line per event to a per-day file
/// `<logs_dir>/agent-YYYY-MM-DD.log`. Rollover happens by filename when the
/// local date changes.
pub(crate) struct DailyFileLayer {
    logs_dir: String,
    current: Mutex<Option<(String, File)>>,
}

impl DailyFileLayer {
    pub fn new(logs_dir: impl Into<String>) -> Self {
        let logs_dir = logs_dir.into();
        std::fs::create_dir_all(&logs_dir).ok();
        Self { logs_dir, current: Mutex::new(None) }
    }

    fn write_line(&self, line: &str) {
        let day = chrono::Local::now().format("%Y-%m-%d").to_string();
        let mut guard = self.current.lock().unwrap_or_else(|e| e.into_inner());
        let needs_open = match guard.as_ref() {
            Some((open_day, _)) => *open_day != day,
            None => true,
        };
        if needs_open {
            let path = format!("{}/agent-{day}.log", self.logs_dir);
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(f) => *guard = Some((day, f)),
                Err(_) => return,
            }
        }
        if let Some((_, f)) = guard.as_mut() {
            let _ = f.write_all(line.as_bytes());
        }
    }
}

struct MessageVisitor<'a> {
    message: &'a mut String,
}

impl tracing::field::Visit for MessageVisitor<'_> {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            *self.message = value.to_string();
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message.clear();
            use std::fmt::Write;
            let _ = write!(self.message, "{value:?}");
            // Strip surrounding quotes added by Debug on &str
            if self.message.starts_with('"') && self.message.ends_with('"') {
                *self.message = self.message[1..self.message.len() - 1].to_string();
            }
        }
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for DailyFileLayer {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let level = match *event.metadata().level() {
            tracing::Level::ERROR => "ERROR",
            tracing::Level::WARN => "WARN",
            tracing::Level::INFO => "INFO",
            tracing::Level::DEBUG => "DEBUG",
            tracing::Level::TRACE => return,
        };

        let mut message = String::new();
        event.record(&mut MessageVisitor { message: &mut message });

        let line = format!(
            "{} {level:5} {} {message}\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            event.metadata().target(),
        );
        self.write_line(&line);
    }
}
