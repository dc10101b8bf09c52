//! Demo functions served by the `fnjob` binary
//!
//! Both the server and its workers call [`registry`], so registration must
//! not depend on anything but its argument.

use anyhow::Context;
use fnjob_task::{ArgSpec, ArgType, FunctionDefinition, FunctionRegistry};
use serde_json::{json, Value};
use std::time::Duration;

/// Build the demo registry
pub fn registry(default_timeout: Duration) -> fnjob_foundation::Result<FunctionRegistry> {
    let mut registry = FunctionRegistry::new().with_default_timeout(default_timeout);

    registry.register(
        FunctionDefinition::new("add", |args| Ok(args.integer("x")? + args.integer("y")?))
            .arg(ArgSpec::required("x", ArgType::Integer, "x"))
            .arg(ArgSpec::required("y", ArgType::Integer, "y"))
            .with_max_concurrency(1)
            .with_timeout(Duration::from_secs(60))
            .with_description("Simple Addition"),
    )?;

    registry.register(
        FunctionDefinition::new("fail", |_| -> anyhow::Result<()> {
            anyhow::bail!("intentional failure")
        })
        .with_description("Always fails"),
    )?;

    registry.register(
        FunctionDefinition::new("sleep", |args| {
            let seconds = args.float("seconds")?;
            let duration = Duration::try_from_secs_f64(seconds)
                .with_context(|| format!("cannot sleep for {} seconds", seconds))?;
            std::thread::sleep(duration);
            Ok(seconds)
        })
        .arg(ArgSpec::required("seconds", ArgType::Float, "How long to sleep"))
        .with_max_concurrency(2)
        .with_description("Sleep, then return the duration"),
    )?;

    registry.register(
        FunctionDefinition::new("long_process", |_| {
            std::thread::sleep(Duration::from_secs(100));
            Ok(())
        })
        .with_max_concurrency(1)
        .with_timeout(Duration::from_secs(2))
        .with_description("timeout test"),
    )?;

    registry.register(
        FunctionDefinition::new("echo", |args| {
            let message = args.string("message")?;
            let times = args.opt_integer("times")?.unwrap_or(1).max(0) as usize;
            let message = if args.opt_boolean("loud")?.unwrap_or(false) {
                message.to_uppercase()
            } else {
                message
            };
            let tags = args.opt_list("tags")?.unwrap_or_default();
            let meta = args.opt_dict("meta")?.map(Value::Object).unwrap_or(Value::Null);
            Ok(json!({
                "message": message.repeat(times),
                "tags": tags,
                "meta": meta,
            }))
        })
        .arg(ArgSpec::required("message", ArgType::String, "Text to echo"))
        .arg(ArgSpec::optional("times", ArgType::Integer, "Repetitions"))
        .arg(ArgSpec::optional("loud", ArgType::Boolean, "Upper-case the text"))
        .arg(ArgSpec::optional("tags", ArgType::List, ""))
        .arg(ArgSpec::optional("meta", ArgType::Dict, "")),
    )?;

    registry.register(
        FunctionDefinition::new("no_arg_job", |_| {
            eprintln!("No args (pid {})", std::process::id());
            Ok(())
        })
        .with_max_concurrency(1),
    )?;

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fnjob_task::CallArguments;

    #[test]
    fn test_registry_builds() {
        let registry = registry(Duration::from_secs(86_400)).unwrap();
        assert_eq!(registry.len(), 6);
        assert_eq!(registry.lookup("add").unwrap().timeout(), Duration::from_secs(60));
        assert_eq!(
            registry.lookup("fail").unwrap().timeout(),
            Duration::from_secs(86_400)
        );
    }

    #[test]
    fn test_echo() {
        let registry = registry(Duration::from_secs(60)).unwrap();
        let mut args = CallArguments::new();
        args.insert("message", json!("ab"));
        args.insert("times", json!(2));
        args.insert("loud", json!(true));

        let value = registry.lookup("echo").unwrap().call(&args).unwrap().unwrap();
        assert_eq!(value["message"], json!("ABAB"));
        assert_eq!(value["meta"], Value::Null);
    }

    #[test]
    fn test_sleep_rejects_negative() {
        let registry = registry(Duration::from_secs(60)).unwrap();
        let mut args = CallArguments::new();
        args.insert("seconds", json!(-1.0));
        assert!(registry.lookup("sleep").unwrap().call(&args).is_err());
    }
}
