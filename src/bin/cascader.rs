use cascader::cascade::{RunMode, RunRequest};
use cascader::config::{Settings, DEFAULT_SETTINGS_FILE};
use cascader::ledger::ReceiptQuery;
use cascader::runtime::{EventLevel, RunHandle, Supervisor};
use cascader::shared::credentials::{CredentialProvider, SystemCredentials};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

const USAGE: &str = "usage:
  cascader run --mode GENERATE|MODIFY|QA|QFILE|BATCH --model <id> --prompt <text> [options]
  cascader resume <run_id>
  cascader runs
  cascader receipts [--run <run_id>] [--model <id>]
  cascader batches [--cancel <batch_id>]

run options:
  --prompt-file <path>   read the prompt from a file instead of --prompt
  --project <name>       project label for receipts and vector stores
  --in <dir>             input root (MODIFY)
  --out <dir>            output root
  --prev <response_id>   chain onto an existing response
  --attach <file_id>     attach a provider file (repeatable)
  --versioning           snapshot the output tree before the first write
  --dry-run              MODIFY only: stop after B2 and ask before writing
  --file-search          build a vector store and request the search tool";

fn main() {
    if let Err(err) = run(std::env::args().skip(1).collect()) {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run(args: Vec<String>) -> Result<(), String> {
    let settings = Settings::load_or_default(Path::new(DEFAULT_SETTINGS_FILE))
        .map_err(|err| format!("failed to load {DEFAULT_SETTINGS_FILE}: {err}"))?;
    match args.first().map(String::as_str) {
        Some("run") => cmd_run(&settings, &args[1..]),
        Some("resume") => cmd_resume(&settings, &args[1..]),
        Some("runs") => cmd_runs(&settings),
        Some("receipts") => cmd_receipts(&settings, &args[1..]),
        Some("batches") => cmd_batches(&settings, &args[1..]),
        _ => Err(USAGE.to_string()),
    }
}

fn flag_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn flag_values(args: &[String], name: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        if arg == name {
            if let Some(value) = iter.peek() {
                out.push((*value).clone());
            }
        }
    }
    out
}

fn has_flag(args: &[String], name: &str) -> bool {
    args.iter().any(|a| a == name)
}

fn build_supervisor(settings: &Settings) -> Result<Supervisor, String> {
    Supervisor::with_http_provider(settings.clone(), &EnvFallbackCredentials).map_err(|err| {
        format!("{err}; store one under the `api_key` credential or set OPENAI_API_KEY")
    })
}

/// Vault first, then the conventional environment variable.
struct EnvFallbackCredentials;

impl CredentialProvider for EnvFallbackCredentials {
    fn get(&self, name: &str) -> Option<String> {
        SystemCredentials
            .get(name)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok().filter(|v| !v.is_empty()))
    }
}

fn cmd_run(settings: &Settings, args: &[String]) -> Result<(), String> {
    let mode = flag_value(args, "--mode")
        .and_then(RunMode::parse)
        .ok_or_else(|| format!("--mode is required\n{USAGE}"))?;
    let model = flag_value(args, "--model")
        .ok_or_else(|| format!("--model is required\n{USAGE}"))?
        .to_string();
    let prompt = match (flag_value(args, "--prompt"), flag_value(args, "--prompt-file")) {
        (Some(text), _) => text.to_string(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .map_err(|err| format!("failed to read prompt file {path}: {err}"))?,
        (None, None) => return Err(format!("--prompt or --prompt-file is required\n{USAGE}")),
    };

    let request = RunRequest {
        mode,
        project: flag_value(args, "--project").unwrap_or_default().to_string(),
        model,
        prompt,
        previous_response_id: flag_value(args, "--prev").map(str::to_string),
        input_root: flag_value(args, "--in").map(PathBuf::from),
        output_root: flag_value(args, "--out").map(PathBuf::from),
        attached_file_ids: flag_values(args, "--attach"),
        versioning: has_flag(args, "--versioning"),
        dry_run: has_flag(args, "--dry-run"),
        use_file_search: has_flag(args, "--file-search"),
        skip_paths: Vec::new(),
        skip_extensions: Vec::new(),
    };

    let supervisor = build_supervisor(settings)?;
    let handle = supervisor.start(request).map_err(|err| err.to_string())?;
    println!("run {} started", handle.run_id);
    drive_run(&handle)
}

fn cmd_resume(settings: &Settings, args: &[String]) -> Result<(), String> {
    let run_id = args
        .first()
        .ok_or_else(|| format!("resume needs a run id\n{USAGE}"))?;
    let supervisor = build_supervisor(settings)?;
    let handle = supervisor.resume(run_id).map_err(|err| err.to_string())?;
    println!("run {} resumed", handle.run_id);
    drive_run(&handle)
}

fn drive_run(handle: &RunHandle) -> Result<(), String> {
    for event in handle.events() {
        let marker = match event.level {
            EventLevel::Error => "!!",
            EventLevel::Warn => " !",
            _ => "  ",
        };
        println!(
            "{marker} [{:>3}%] {:<8} {}: {}",
            event.percent, event.step, event.kind, event.message
        );
        if event.kind == "dry_run.waiting" {
            print!("dry-run stopped after B2. continue with B3? [y/N] ");
            std::io::stdout().flush().ok();
            let mut answer = String::new();
            std::io::stdin().lock().read_line(&mut answer).ok();
            if answer.trim().eq_ignore_ascii_case("y") {
                handle.approve_continue();
            } else {
                handle.cancel();
            }
        }
    }
    let outcome = handle.wait().map_err(|err| err.to_string())?;
    if let Some(answer) = &outcome.answer {
        println!("{answer}");
    }
    for path in &outcome.saved_paths {
        println!("saved {path}");
    }
    for path in &outcome.failed_paths {
        println!("FAILED {path}");
    }
    if let Some(snapshot) = &outcome.snapshot_dir {
        println!("snapshot {}", snapshot.display());
    }
    Ok(())
}

fn cmd_runs(settings: &Settings) -> Result<(), String> {
    let runs = cascader::runlog::list_runs(&settings.log_dir);
    if runs.is_empty() {
        println!("no runs under {}", settings.log_dir.display());
        return Ok(());
    }
    for run in runs {
        println!(
            "{}  {:<9} {:<8} {}",
            run.run_id, run.status, run.mode, run.model
        );
    }
    Ok(())
}

fn cmd_batches(settings: &Settings, args: &[String]) -> Result<(), String> {
    use cascader::cascade::batch::list_open_batches;
    use cascader::provider::{HttpProvider, ProviderApi, Transport};
    use cascader::runtime::CancelFlag;
    use std::time::Duration;

    let api_key = EnvFallbackCredentials
        .get("api_key")
        .ok_or("no API key: store one under the `api_key` credential or set OPENAI_API_KEY")?;
    let api = HttpProvider::new(Transport::new(
        &settings.provider_base_url,
        &api_key,
        settings.retry,
        Duration::from_secs(settings.request_timeout_s),
        CancelFlag::new(),
    ));

    if let Some(batch_id) = flag_value(args, "--cancel") {
        let info = api.cancel_batch(batch_id).map_err(|err| err.to_string())?;
        println!("{}  {}", info.id, info.status);
        return Ok(());
    }
    let open = list_open_batches(&api).map_err(|err| err.to_string())?;
    if open.is_empty() {
        println!("no open batches");
        return Ok(());
    }
    for batch in open {
        println!("{}  {}", batch.id, batch.status);
    }
    Ok(())
}

fn cmd_receipts(settings: &Settings, args: &[String]) -> Result<(), String> {
    let ledger = cascader::ledger::ReceiptLedger::open(&settings.ledger_path)
        .map_err(|err| err.to_string())?;
    let query = ReceiptQuery {
        run_id: flag_value(args, "--run").map(str::to_string),
        model: flag_value(args, "--model").map(str::to_string),
        ..Default::default()
    };
    let receipts = ledger.query(&query).map_err(|err| err.to_string())?;
    if receipts.is_empty() {
        println!("no receipts");
        return Ok(());
    }
    for receipt in receipts {
        println!(
            "{}  {:<14} {:<8} in={} out={} total=${:.6}{}",
            receipt.run_id,
            receipt.step_key,
            receipt.mode,
            receipt.input_tokens,
            receipt.output_tokens,
            receipt.total_cost,
            if receipt.cost_estimated { " (estimated)" } else { "" },
        );
    }
    Ok(())
}
