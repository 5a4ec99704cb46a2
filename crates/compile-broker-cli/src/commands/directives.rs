//! Parse a directive file and resolve a method against it (`cbroker directives`).

use anyhow::{anyhow, Context};
use compile_broker::{ClassHolder, CompilerKind, DirectivesStack, Method};
use std::path::Path;

pub fn execute(file: &Path, method: Option<&str>, compiler: &str) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let stack = DirectivesStack::new();
    let pushed = stack
        .push_json(&text)
        .with_context(|| format!("parsing {}", file.display()))?;
    println!("{} directive set(s) in {}", pushed, file.display());

    let mut listing = String::new();
    stack.print(&mut listing)?;
    print!("{}", listing);

    let Some(name) = method else {
        return Ok(());
    };
    let kind: CompilerKind = serde_json::from_value(serde_json::Value::String(compiler.to_lowercase()))
        .map_err(|_| anyhow!("unknown compiler '{}', expected c1, c2 or external", compiler))?;
    let (class, method_name) = name
        .split_once("::")
        .ok_or_else(|| anyhow!("expected Class::method, got '{}'", name))?;

    let holder = ClassHolder::new(class);
    let target = Method::builder(&holder, method_name).build();
    let directive = stack.lookup(&target, kind);
    println!();
    println!("{} ({}):", name, kind.name());
    println!("{}", serde_json::to_string_pretty(&*directive)?);
    Ok(())
}
