use anyhow::{Context, Result};
use oql_dispatcher::pipeline::{translate, QueryInput, Translation};
use oql_dispatcher::registry::Registry;
use oql_dispatcher::render::NoDisplayNames;
use oql_dispatcher::sql_compiler::SqlCompiler;
use oql_dispatcher::url_filter::UrlQuery;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const REGISTRY_FILE: &str = "oql_registry.json";

const HELP: &str = "\
Enter a query in any format:
  Works where it's Open Access and year >= 2020; sort by citations desc
  url works publication_year:2020-,type:article cited_by_count:desc
  {\"get_rows\": \"authors\", \"filter_rows\": [{\"column_id\": \"count(works)\", \"value\": 10, \"operator\": \"is greater than\"}]}
Commands: help, quit";

/// Loads the registry file next to the binary, falling back to the built-in one.
fn load_registry() -> Result<Registry> {
    match Registry::from_json_file(REGISTRY_FILE) {
        Ok(registry) => {
            info!(file = REGISTRY_FILE, "loaded registry");
            Ok(registry)
        }
        Err(e) => {
            warn!(file = REGISTRY_FILE, error = %e, "using the built-in registry");
            Registry::builtin().context("built-in registry is invalid")
        }
    }
}

/// `url <entity> <filter> [<sort>]`, OQO JSON, or OQL.
fn read_input(line: &str) -> QueryInput {
    if let Some(rest) = line.strip_prefix("url ") {
        let mut parts = rest.split_whitespace();
        let entity = parts.next().unwrap_or_default().to_string();
        let query = UrlQuery {
            filter: parts.next().map(str::to_string),
            sort: parts.next().map(str::to_string),
            sample: None,
        };
        return QueryInput::Url { entity, query };
    }
    if line.starts_with('{') {
        return QueryInput::OqoJson(line.to_string());
    }
    QueryInput::Oql(line.to_string())
}

fn print_translation(translation: &Translation, compiler: &SqlCompiler) -> Result<()> {
    println!("\n[OQO]:\n{}", serde_json::to_string_pretty(&translation.oqo)?);
    println!("\n[OQL]:\n{}", translation.oql);
    match &translation.url {
        Some(url) => println!("\n[URL]:\n{}", serde_json::to_string(url)?),
        None => println!("\n[URL]: not expressible"),
    }
    for warning in &translation.warnings {
        println!("warning: {}", warning);
    }

    match compiler.compile_oqo(&translation.oqo) {
        Ok(compiled) => {
            println!("\n[SQL]:\n{}", compiled.rows.sql);
            if let Some(count) = &compiled.works_count {
                println!("\n[SQL works count]:\n{}", count.sql);
            }
        }
        Err(e) => println!("\n✗ {}", e),
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let registry = Arc::new(load_registry()?);
    let compiler = SqlCompiler::new(Arc::clone(&registry));

    println!("--- oql-shell: URL / OQL / OQO translator ---");
    println!("{}", HELP);

    let mut editor = DefaultEditor::new()?;
    loop {
        let line = match editor.readline("oql> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(line);

        match line {
            "quit" | "exit" => break,
            "help" => println!("{}", HELP),
            _ => match translate(&read_input(line), &registry, &NoDisplayNames) {
                Ok(translation) => print_translation(&translation, &compiler)?,
                Err(e) => {
                    println!("✗ {}", e);
                    if let Some(span) = e.span() {
                        println!("  at {}..{}: {}", span.start, span.end, &line[span.start..span.end.min(line.len())]);
                    }
                }
            },
        }
    }
    Ok(())
}
