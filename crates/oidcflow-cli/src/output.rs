use colored::Colorize;
use oidcflow::{AuthorizedState, OidcEvent};
use serde_json::Value;

use crate::cli::OutputFormat;

pub fn print_value(value: &Value, format: OutputFormat) {
    match format {
        OutputFormat::Json => match serde_json::to_string_pretty(value) {
            Ok(json) => println!("{json}"),
            Err(e) => print_error(&format!("cannot render output: {e}")),
        },
        OutputFormat::Text => print_fields(value, 0),
    }
}

pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

pub fn print_info(msg: &str) {
    println!("{} {}", "→".cyan(), msg);
}

pub fn print_state(config_id: &str, state: AuthorizedState) {
    let label = match state {
        AuthorizedState::Authorized => state.as_str().green(),
        AuthorizedState::Unauthorized => state.as_str().red(),
        AuthorizedState::Unknown => state.as_str().yellow(),
    };
    println!("{}: {}", config_id.cyan(), label);
}

pub fn print_event(event: &OidcEvent, format: OutputFormat) {
    match format {
        OutputFormat::Json => match serde_json::to_string(event) {
            Ok(json) => println!("{json}"),
            Err(e) => print_error(&format!("cannot render event: {e}")),
        },
        OutputFormat::Text => println!("{} {}", "event".dimmed(), event),
    }
}

fn print_fields(value: &Value, indent: usize) {
    let pad = "  ".repeat(indent);
    match value {
        Value::Object(map) => {
            for (key, value) in map {
                match value {
                    Value::Object(_) | Value::Array(_) => {
                        println!("{pad}{}:", key.cyan());
                        print_fields(value, indent + 1);
                    }
                    _ => println!("{pad}{}: {}", key.cyan(), scalar(value)),
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::Object(_) | Value::Array(_) => print_fields(item, indent + 1),
                    _ => println!("{pad}- {}", scalar(item)),
                }
            }
        }
        _ => println!("{pad}{}", scalar(value)),
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}
