use std::fmt;
use std::io::IsTerminal;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

mod ansi {
    pub const RESET: &str = "\x1b[0m";
    pub const TIMESTAMP: &str = "\x1b[36m";
    pub const ERROR: &str = "\x1b[91m";
    pub const WARN: &str = "\x1b[93m";
    pub const INFO: &str = "\x1b[32m";
    pub const DEBUG: &str = "\x1b[90m";
}

const COMPONENT_WIDTH: usize = 12;
const LEVEL_WIDTH: usize = 9;

/// `[timestamp] [component] [level] message key=value ...`
///
/// The component is taken from the event's target: events from the
/// `wss_session` crate show as `wss-session`, anything else as the service
/// name.
pub struct WssLogFormatter {
    service_name: String,
    color_enabled: bool,
}

impl WssLogFormatter {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled: is_terminal(),
        }
    }

    /// Fixed-width component column
    fn format_component(&self, target: &str) -> String {
        let name = match crate_component(target) {
            Some(component) => format!("{}-{}", self.service_name, component),
            None => self.service_name.clone(),
        };

        if name.chars().count() > COMPONENT_WIDTH {
            let truncated: String = name.chars().take(COMPONENT_WIDTH - 1).collect();
            format!("{}…", truncated)
        } else {
            format!("{:<width$}", name, width = COMPONENT_WIDTH)
        }
    }

    /// Label and colour for a level; the colour is empty when colours are off
    fn level_style(&self, level: &Level) -> (&'static str, &'static str) {
        let (label, color) = match *level {
            Level::ERROR => ("✗ ERROR", ansi::ERROR),
            Level::WARN => ("⚠ WARN", ansi::WARN),
            Level::INFO => ("ℹ INFO", ansi::INFO),
            Level::DEBUG => ("◦ DEBUG", ansi::DEBUG),
            Level::TRACE => ("◦ TRACE", ansi::DEBUG),
        };
        (label, self.paint(color))
    }

    fn paint(&self, color: &'static str) -> &'static str {
        if self.color_enabled {
            color
        } else {
            ""
        }
    }
}

impl<S, N> FormatEvent<S, N> for WssLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let (label, color) = self.level_style(metadata.level());

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        write!(
            writer,
            "{}[{}]{} [{}] [{}{:<level_width$}{}] {}",
            self.paint(ansi::TIMESTAMP),
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            self.paint(ansi::RESET),
            self.format_component(metadata.target()),
            color,
            label,
            self.paint(ansi::RESET),
            visitor.message,
            level_width = LEVEL_WIDTH
        )?;
        for (name, value) in &visitor.fields {
            write!(writer, " {}={}", name, value)?;
        }
        writeln!(writer)
    }
}

/// Collects the message and any structured fields of an event
#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: Vec<(&'static str, String)>,
}

impl FieldVisitor {
    fn push(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = value;
        } else {
            self.fields.push((field.name(), value));
        }
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field, value.to_owned());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.push(field, format!("{:?}", value));
    }
}

/// `wss_session::client` -> `session`
fn crate_component(target: &str) -> Option<&str> {
    target
        .split("::")
        .next()
        .and_then(|krate| krate.strip_prefix("wss_"))
        .filter(|component| !component.is_empty())
}

/// Colors only when stdout is a terminal that understands them
fn is_terminal() -> bool {
    if std::env::var("TERM").map_or(false, |term| term == "dumb") {
        return false;
    }
    std::io::stdout().is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain() -> WssLogFormatter {
        WssLogFormatter {
            service_name: "wss".to_string(),
            color_enabled: false,
        }
    }

    #[test]
    fn test_component_from_target() {
        assert_eq!(crate_component("wss_session::client"), Some("session"));
        assert_eq!(crate_component("wss_auth"), Some("auth"));
        assert_eq!(crate_component("wss"), None);
        assert_eq!(crate_component("tokio_tungstenite::compat"), None);
    }

    #[test]
    fn test_component_column_is_fixed_width() {
        let formatter = plain();
        assert_eq!(formatter.format_component("wss_session::server"), "wss-session ");
        assert_eq!(formatter.format_component("wss"), "wss         ");

        let long = formatter.format_component("wss_verylongcomponent");
        assert_eq!(long.chars().count(), COMPONENT_WIDTH);
        assert!(long.ends_with('…'));
    }

    #[test]
    fn test_levels_without_color() {
        let formatter = plain();
        assert_eq!(formatter.level_style(&Level::WARN), ("⚠ WARN", ""));
        assert_eq!(formatter.level_style(&Level::TRACE), ("◦ TRACE", ""));

        let colored = WssLogFormatter {
            color_enabled: true,
            ..plain()
        };
        assert_eq!(colored.level_style(&Level::ERROR).1, ansi::ERROR);
    }
}
