use anyhow::{bail, Context, Result};
use release_sync::{load_payload_dir, unknown_matchers, RequeuePolicy};
use std::env;
use std::path::PathBuf;

fn main() -> Result<()> {
    let args = Args::parse()?;
    let policy = match &args.annotation_key {
        Some(key) => RequeuePolicy::new(key.clone()),
        None => RequeuePolicy::default(),
    };
    let payload = load_payload_dir(&args.payload, "lint", "")
        .with_context(|| format!("unable to load payload {}", args.payload.display()))?;
    println!(
        "payload={} manifests={} digest={}",
        args.payload.display(),
        payload.len(),
        payload.digest()
    );
    let mut unknown_total = 0usize;
    for (index, manifest) in payload.manifests().iter().enumerate() {
        let (present, matchers) = policy.requeue_matchers(manifest.annotations());
        let requeue = if !present {
            "-".to_string()
        } else if matchers.is_empty() {
            "(empty)".to_string()
        } else {
            matchers.join(",")
        };
        println!("{index:>4} {} requeue={requeue}", manifest.reference());
        let unknown = unknown_matchers(&matchers);
        if !unknown.is_empty() {
            unknown_total += unknown.len();
            println!("     warn unknown matchers: {}", unknown.join(","));
        }
    }
    if unknown_total > 0 {
        println!("status=WARNING unknown_matchers={unknown_total}");
        if args.strict {
            bail!("{unknown_total} unknown requeue matcher(s)");
        }
    } else {
        println!("status=OK");
    }
    Ok(())
}

struct Args {
    payload: PathBuf,
    annotation_key: Option<String>,
    strict: bool,
}

impl Args {
    fn parse() -> Result<Self> {
        let mut payload = None;
        let mut annotation_key = None;
        let mut strict = false;
        let mut iter = env::args().skip(1);
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--payload" => {
                    let path = iter
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--payload requires a directory"))?;
                    payload = Some(PathBuf::from(path));
                }
                "--annotation-key" => {
                    let key = iter
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--annotation-key requires a value"))?;
                    annotation_key = Some(key);
                }
                "--strict" => strict = true,
                "--help" | "-h" => {
                    print_usage();
                    std::process::exit(0);
                }
                other => bail!("unknown argument: {other}"),
            }
        }
        let Some(payload) = payload else {
            print_usage();
            bail!("--payload is required");
        };
        Ok(Self {
            payload,
            annotation_key,
            strict,
        })
    }
}

fn print_usage() {
    eprintln!("usage: payload_lint --payload <dir> [--annotation-key <key>] [--strict]");
}
