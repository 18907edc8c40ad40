//! Result and error printing.
//!
//! Uses `termcolor` for the error prefix and respects `NO_COLOR`.

use moonbridge_engine::Value;
use std::io::Write;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

fn color_choice() -> ColorChoice {
    if std::env::var_os("NO_COLOR").is_some() {
        return ColorChoice::Never;
    }
    ColorChoice::Auto
}

/// Print the chunk's result. Nil is only printed in JSON mode.
pub fn print_value(value: &Value, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&value.to_json()?)?);
    } else if !value.is_nil() {
        println!("{}", value);
    }
    Ok(())
}

/// `error: <message>` on stderr, with the context chain.
pub fn print_error(error: &anyhow::Error) {
    let mut stderr = StandardStream::stderr(color_choice());
    let _ = stderr.set_color(ColorSpec::new().set_fg(Some(Color::Red)).set_bold(true));
    let _ = write!(stderr, "error");
    let _ = stderr.reset();
    let _ = writeln!(stderr, ": {}", error);
    for cause in error.chain().skip(1) {
        let _ = writeln!(stderr, "  caused by: {}", cause);
    }
}
