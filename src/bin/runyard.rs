use runyard::backends::{build_backend, supervised, RunnerBackend};
use runyard::config::{default_settings_path, Settings};
use runyard::runs::staging::{Attachment, RunSubmission};
use std::path::{Path, PathBuf};

const USAGE: &str = "\
runyard - workflow-execution run manager

Usage:
  runyard submit --workflow <url-or-file> --params <file> --type <CWL|WDL|PY> --type-version <v> [--attach <file>]... [--engine-arg <arg>]... [--config <path>]
  runyard status <run_id> [--config <path>]
  runyard log <run_id> [--config <path>]
  runyard cancel <run_id> [--config <path>]
  runyard list [--page-size <n>] [--page-token <token>] [--config <path>]
  runyard info [--config <path>]";

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Err(err) = run(args) {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run(args: Vec<String>) -> Result<(), String> {
    let Some((command, rest)) = args.split_first() else {
        return Err(USAGE.to_string());
    };

    match command.as_str() {
        "__supervise" => supervise(rest),
        "submit" => submit(rest),
        "status" => query(rest, |backend, run_id| {
            to_json(&backend.run_status(run_id).map_err(stringify)?)
        }),
        "log" => query(rest, |backend, run_id| {
            to_json(&backend.run_log(run_id).map_err(stringify)?)
        }),
        "cancel" => query(rest, |backend, run_id| {
            let run_id = backend.cancel_run(run_id).map_err(stringify)?;
            Ok(run_id.to_string())
        }),
        "list" => list(rest),
        "info" => {
            let backend = backend_from_args(rest)?;
            println!("{}", to_json(&backend.service_info())?);
            Ok(())
        }
        _ => Err(USAGE.to_string()),
    }
}

fn supervise(args: &[String]) -> Result<(), String> {
    let work_dir = flag_value(args, "--work-dir")?
        .ok_or_else(|| "usage: runyard __supervise --work-dir <dir>".to_string())?;
    supervised::run_supervisor(Path::new(&work_dir)).map(|_| ()).map_err(stringify)
}

fn submit(args: &[String]) -> Result<(), String> {
    let backend = backend_from_args(args)?;

    let workflow = flag_value(args, "--workflow")?
        .ok_or_else(|| "submit requires --workflow".to_string())?;
    let params_file = flag_value(args, "--params")?
        .ok_or_else(|| "submit requires --params".to_string())?;
    let workflow_type = flag_value(args, "--type")?
        .ok_or_else(|| "submit requires --type".to_string())?;
    let workflow_type_version = flag_value(args, "--type-version")?
        .ok_or_else(|| "submit requires --type-version".to_string())?;

    let params_raw = std::fs::read_to_string(&params_file)
        .map_err(|err| format!("failed to read params file {params_file}: {err}"))?;
    let workflow_params: serde_json::Value = serde_json::from_str(&params_raw)
        .map_err(|err| format!("params file {params_file} is not valid json: {err}"))?;

    let mut attachments = Vec::new();
    for file in flag_values(args, "--attach") {
        attachments.push(read_attachment(&file)?);
    }

    // A plain local path becomes an attachment resolved by its basename.
    let workflow_url = if workflow.contains(':') {
        workflow
    } else {
        let attachment = read_attachment(&workflow)?;
        let name = attachment.filename.clone();
        attachments.push(attachment);
        name
    };

    let submission = RunSubmission {
        workflow_url: Some(workflow_url),
        workflow_params: Some(workflow_params),
        workflow_type,
        workflow_type_version,
        workflow_engine_parameters: flag_values(args, "--engine-arg"),
        attachments,
        ..RunSubmission::default()
    };

    let run_id = backend.run_workflow(submission).map_err(stringify)?;
    println!("{run_id}");
    Ok(())
}

fn query<F>(args: &[String], op: F) -> Result<(), String>
where
    F: Fn(&dyn RunnerBackend, &str) -> Result<String, String>,
{
    let run_id = positional_value(args)
        .ok_or_else(|| "expected a run id argument".to_string())?;
    let backend = backend_from_args(args)?;
    println!("{}", op(backend.as_ref(), &run_id)?);
    Ok(())
}

fn list(args: &[String]) -> Result<(), String> {
    let backend = backend_from_args(args)?;
    let page_size = match flag_value(args, "--page-size")? {
        Some(raw) => Some(
            raw.parse::<usize>()
                .map_err(|_| format!("invalid --page-size `{raw}`"))?,
        ),
        None => None,
    };
    let page_token = flag_value(args, "--page-token")?;
    let listing = backend
        .list_runs(page_size, page_token.as_deref())
        .map_err(stringify)?;
    println!("{}", to_json(&listing)?);
    Ok(())
}

fn backend_from_args(args: &[String]) -> Result<Box<dyn RunnerBackend>, String> {
    let settings_path = match flag_value(args, "--config")? {
        Some(path) => PathBuf::from(path),
        None => default_settings_path().map_err(stringify)?,
    };
    let settings = Settings::from_path(&settings_path).map_err(stringify)?;
    build_backend(&settings).map_err(stringify)
}

fn read_attachment(file: &str) -> Result<Attachment, String> {
    let bytes = std::fs::read(file).map_err(|err| format!("failed to read {file}: {err}"))?;
    let filename = Path::new(file)
        .file_name()
        .and_then(|v| v.to_str())
        .ok_or_else(|| format!("cannot derive an attachment name from {file}"))?
        .to_string();
    Ok(Attachment { filename, bytes })
}

fn flag_value(args: &[String], flag: &str) -> Result<Option<String>, String> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == flag {
            return match iter.next() {
                Some(value) => Ok(Some(value.clone())),
                None => Err(format!("{flag} requires a value")),
            };
        }
    }
    Ok(None)
}

fn flag_values(args: &[String], flag: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == flag {
            if let Some(value) = iter.next() {
                values.push(value.clone());
            }
        }
    }
    values
}

fn positional_value(args: &[String]) -> Option<String> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg.starts_with("--") {
            iter.next();
            continue;
        }
        return Some(arg.clone());
    }
    None
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|err| err.to_string())
}

fn stringify(err: impl std::fmt::Display) -> String {
    err.to_string()
}
