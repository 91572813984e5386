use std::{path::Path, sync::Arc};

use clap::Parser;
use localdex::{
    AnnotationStore,
    DataDir,
    IngestConfig,
    IngestionWorker,
    annotator::{Annotator, AnnotatorKind, CommandAnnotator},
    cli::{self, Cli, Command, ConfigAction, IngestArgs},
    config,
    error::{self, Error},
    search,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("LOCALDEX_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> error::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }
    if let Command::Find(args) = &cli.command {
        let results = search::execute_find(args)?;
        if args.json {
            search::format_json(&results, &args.query)?;
        } else {
            search::format_find_human(&results, &args.dir);
        }
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let store = open_store(&data_dir)?;

    match cli.command {
        Command::Index(args) => cmd_ingest(store, &args, false)?,
        Command::Watch(args) => cmd_ingest(store, &args, true)?,
        Command::Search(args) => {
            let results = search::execute_search(&args, &store)?;
            if args.json {
                search::format_json(&results, &args.query)?;
            } else if args.files {
                search::format_files(&results);
            } else {
                search::format_human(&results);
            }
        }
        Command::Get(args) => cmd_get(&store, &args)?,
        Command::List(args) => cmd_list(&store, &args)?,
        Command::Remove(args) => cmd_remove(store, &args.path)?,
        Command::Status(args) => cmd_status(&store, &data_dir, args.json)?,
        Command::Config { action } => cmd_config(&store, action)?,
        Command::Find(_) | Command::Completions(_) => {}
    }

    Ok(())
}

fn open_store(data_dir: &DataDir) -> error::Result<AnnotationStore> {
    let store = AnnotationStore::open(&data_dir.annotations_db())?;
    let threshold = config::relevance_threshold(&store)?;
    Ok(store.with_relevance_threshold(threshold))
}

/// Configuration for an ingestion run: persisted settings, then flags.
fn ingest_config(
    store: &AnnotationStore,
    args: &IngestArgs,
    watch: bool,
) -> error::Result<IngestConfig> {
    let mut config = IngestConfig::load(store)?;
    if !args.extensions.is_empty() {
        config.extensions = args.extensions.clone();
    }
    if !args.exclude.is_empty() {
        config.exclude = args
            .exclude
            .iter()
            .map(|p| p.canonicalize().unwrap_or_else(|_| p.clone()))
            .collect();
    }
    if let Some(threshold) = args.label_threshold {
        config.label_threshold = threshold;
    }
    config.watch = watch;
    Ok(config)
}

fn annotators(
    store: &AnnotationStore,
    args: &IngestArgs,
) -> error::Result<Vec<Arc<dyn Annotator>>> {
    let ocr = match &args.ocr_cmd {
        Some(cmd) => Some(cmd.clone()),
        None => store.get_setting(config::KEY_OCR_COMMAND)?,
    };
    let labels = match &args.label_cmd {
        Some(cmd) => Some(cmd.clone()),
        None => store.get_setting(config::KEY_LABEL_COMMAND)?,
    };

    let mut annotators: Vec<Arc<dyn Annotator>> = Vec::new();
    if let Some(cmd) = ocr {
        annotators.push(Arc::new(CommandAnnotator::new(AnnotatorKind::Ocr, &cmd)?));
    }
    if let Some(cmd) = labels {
        annotators
            .push(Arc::new(CommandAnnotator::new(AnnotatorKind::Labels, &cmd)?));
    }
    if annotators.is_empty() {
        return Err(Error::Config(
            "no annotator configured: pass --ocr-cmd and/or --label-cmd".into(),
        ));
    }
    Ok(annotators)
}

fn cmd_ingest(
    store: AnnotationStore,
    args: &IngestArgs,
    watch: bool,
) -> error::Result<()> {
    for dir in &args.dirs {
        if !dir.is_dir() {
            return Err(Error::Config(format!(
                "path is not a directory: {}",
                dir.display()
            )));
        }
    }
    let config = ingest_config(&store, args, watch)?;
    let annotators = annotators(&store, args)?;

    let runtime = tokio::runtime::Runtime::new()?;
    let stats = runtime.block_on(async {
        let handle = IngestionWorker::spawn(
            store,
            config,
            args.dirs.clone(),
            annotators,
        );
        handle.wait_idle().await?;
        if watch {
            info!("initial ingestion done, watching for changes (ctrl-c to stop)");
            tokio::signal::ctrl_c().await?;
        }
        let stats = handle.stats().await?;
        handle.shutdown().await?;
        Ok::<_, Error>(stats)
    })?;

    if args.json {
        println!("{}", serde_json::to_string(&stats)?);
    } else {
        eprintln!(
            "Annotated {} file(s), {} unchanged, {} removed, {} undecodable, {} annotator failure(s).",
            stats.annotated,
            stats.skipped_unchanged,
            stats.removed,
            stats.decode_failures,
            stats.annotator_failures
        );
    }
    Ok(())
}

fn cmd_get(store: &AnnotationStore, args: &cli::GetArgs) -> error::Result<()> {
    let path = args.path.canonicalize().unwrap_or_else(|_| args.path.clone());
    let infos = store.find_by_path(&path)?;
    let Some(info) = infos.first() else {
        return Err(Error::NotFound {
            kind: "annotated file",
            name: path.display().to_string(),
        });
    };

    if args.json {
        println!("{}", serde_json::to_string(info)?);
    } else {
        search::format_infos(&infos);
    }
    Ok(())
}

fn cmd_list(store: &AnnotationStore, args: &cli::ListArgs) -> error::Result<()> {
    let glob = match &args.pattern {
        Some(pattern) => Some(
            globset::Glob::new(pattern)
                .map_err(|e| Error::Config(format!("invalid glob pattern: {e}")))?
                .compile_matcher(),
        ),
        None => None,
    };

    let infos: Vec<_> = store
        .get_all()?
        .into_iter()
        .filter(|info| glob.as_ref().is_none_or(|g| g.is_match(&info.path)))
        .collect();

    if args.json {
        println!("{}", serde_json::to_string(&infos)?);
    } else if infos.is_empty() {
        println!("No annotated files.");
    } else {
        search::format_infos(&infos);
        println!("\n{} file(s)", infos.len());
    }
    Ok(())
}

fn cmd_remove(mut store: AnnotationStore, path: &Path) -> error::Result<()> {
    let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !store.remove(&path)? {
        return Err(Error::NotFound {
            kind: "annotated file",
            name: path.display().to_string(),
        });
    }
    println!("Removed annotations for {}", path.display());
    Ok(())
}

fn cmd_status(
    store: &AnnotationStore,
    data_dir: &DataDir,
    json: bool,
) -> error::Result<()> {
    let documents = store.document_count()?;
    let terms = store.term_count()?;

    if json {
        let status = serde_json::json!({
            "data_dir": data_dir.root(),
            "database": data_dir.annotations_db(),
            "documents": documents,
            "terms": terms,
            "relevance_threshold": store.relevance_threshold(),
        });
        println!("{status}");
    } else {
        println!("Data directory: {}", data_dir.root().display());
        println!("Database: {}", data_dir.annotations_db().display());
        println!("Files: {documents}");
        println!("Terms: {terms}");
        println!("Relevance threshold: {}", store.relevance_threshold());
    }
    Ok(())
}

fn cmd_config(store: &AnnotationStore, action: ConfigAction) -> error::Result<()> {
    match action {
        ConfigAction::Show { json } => {
            let settings = store.list_settings()?;
            if json {
                let map: serde_json::Map<String, serde_json::Value> = settings
                    .into_iter()
                    .map(|(k, v)| (k, serde_json::Value::String(v)))
                    .collect();
                println!("{}", serde_json::Value::Object(map));
            } else if settings.is_empty() {
                println!("No settings stored; defaults apply.");
            } else {
                for (key, value) in &settings {
                    println!("{key}\t{value}");
                }
            }
        }
        ConfigAction::Set { key, value } => {
            config::validate_setting(&key, &value)?;
            store.set_setting(&key, &value)?;
            println!("Set {key} = {value}");
        }
        ConfigAction::Clear { key } => {
            if !store.remove_setting(&key)? {
                return Err(Error::NotFound {
                    kind: "setting",
                    name: key,
                });
            }
            println!("Cleared {key}");
        }
    }
    Ok(())
}
