use std::{process::ExitCode, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::{pin_mut, StreamExt};
use portal_search::{
    query::{FilterTree, Query},
    search::{cursor::SearchCursor, images::ImageFilter, session::SessionTracker},
    settings::{Args, Command, QueryArgs},
    SearchContext, Settings,
};
use serde_json::{json, Value};
use tracing::{error, info, Level};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(args: Args) -> Result<()> {
    let settings = Settings::load(args.config.as_deref()).context("cannot load configuration")?;
    info!("using portal at {}", settings.portal.base_url);
    let context = SearchContext::connect(&settings).await?;
    if context.catalog_status.failed {
        bail!(
            "cannot load the resource catalog: {}",
            context.catalog_status.error.as_deref().unwrap_or("unknown error")
        );
    }

    match args.command {
        Command::Search { query, pages } => {
            let query = build_query(&context, &query).await?;
            search(&context, &query, pages).await
        }
        Command::Count { query } => {
            let query = build_query(&context, &query).await?;
            println!("{}", context.count(&query).await?);
            Ok(())
        }
        Command::Resources => {
            for package in context.catalog.packages() {
                for resource in &package.resources {
                    let line = json!({
                        "id": resource.id,
                        "name": resource.name,
                        "package": package.title,
                        "image_field": resource.image_field,
                        "dwc": resource.dwc,
                    });
                    println!("{line}");
                }
            }
            Ok(())
        }
        Command::Resolve { slug } => {
            let body = context.slugs().resolve(&slug).await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(())
        }
        Command::Slug { query, reserve } => {
            let query = build_query(&context, &query).await?;
            let mut slugs = context.slugs();
            let created = slugs.create(&query).await?;
            if let Some(name) = reserve {
                if !slugs.edit(&created.slug, &name).await {
                    bail!(
                        "cannot reserve `{name}`: {}",
                        slugs.edit_status().error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            let current = slugs.current().unwrap_or(&created);
            println!("{}", serde_json::to_string(current)?);
            Ok(())
        }
        Command::Autocomplete {
            query,
            field,
            prefix,
            limit,
        } => {
            let query = build_query(&context, &query).await?;
            let page_size = u32::try_from(limit).unwrap_or(u32::MAX).max(1);
            let values = context
                .autocomplete(&query, &field, &prefix)
                .page_size(page_size)
                .take(limit)
                .await?;
            for value in values {
                println!("{}", display_value(&value));
            }
            Ok(())
        }
        Command::Images { query, more } => {
            let query = build_query(&context, &query).await?;
            images(&context, &query, more).await
        }
    }
}

/// Compose a query from the command line, starting from a slug if given.
async fn build_query(context: &SearchContext, args: &QueryArgs) -> Result<Query> {
    let mut query = context.query();
    if let Some(slug) = &args.slug {
        let applied = context.slugs().resolve_into(slug, &mut query).await?;
        if !applied {
            eprintln!("Warning: parts of `{slug}` could not be applied: {:?}", query.parsing_error);
        }
    }
    if let Some(text) = &args.text {
        query.search = Some(text.clone());
    }
    if let Some(filters) = &args.filters {
        let filters: Value = serde_json::from_str(filters).context("--filters is not JSON")?;
        query.filters =
            FilterTree::parse(Some(&filters)).context("--filters is not a filter tree")?;
    }
    if !args.resources.is_empty() {
        query.resources.set(&args.resources)?;
    }
    Ok(query)
}

async fn search(context: &SearchContext, query: &Query, pages: Option<usize>) -> Result<()> {
    let tracker = SessionTracker::new();
    let cursor = SearchCursor::open(
        Arc::clone(&context.portal),
        &tracker,
        query.request_body(false),
        context.settings.page_size,
        context.settings.buffer_size,
    );
    let limit = pages.map(|p| p * context.settings.page_size as usize);
    let stream = cursor.into_stream();
    pin_mut!(stream);
    let mut printed = 0;
    while let Some(record) = stream.next().await {
        let record = record?;
        println!("{}", serde_json::to_string(&record)?);
        printed += 1;
        if limit.is_some_and(|limit| printed >= limit) {
            break;
        }
    }
    info!("{printed} records written");
    Ok(())
}

async fn images(context: &SearchContext, query: &Query, more: usize) -> Result<()> {
    let mut search = context.image_search();
    search.set_query(query, ImageFilter::default()).await;
    for _ in 0..more {
        if search.load_more().await.is_none() {
            break;
        }
    }
    for record in search.aggregator().records() {
        for loaded in &record.images {
            println!("{}\t{}\t{}", record.key, loaded.image.url, loaded.image.thumbnail);
        }
    }
    let (requested, failed) = search.aggregator().image_stats();
    eprintln!(
        "{} records of {}, {failed} of {requested} images failed{}",
        search.aggregator().len(),
        search.aggregator().total(),
        if search.auto_load_suppressed() {
            ", auto-loading suppressed"
        } else {
            ""
        }
    );
    if let Some(error) = &search.status().error {
        bail!("search failed: {error}");
    }
    Ok(())
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
