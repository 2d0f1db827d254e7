use std::{
    collections::HashMap,
    io::{self, Write},
    process::ExitCode,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, PoisonError,
    },
    thread,
    time::SystemTime,
};

use aws_sdk_s3::primitives::ByteStream;
use clap::{Arg, ArgAction, ArgMatches, Command};
use obsblob::{
    model::blob::{ListBlobsInput, PutBlobInput},
    util::object::parse_bucket_from_uri,
    BackendConfig, BackendError, ObsBackend, StorageBackend,
};
use thiserror::Error;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{error, info, span, warn, Level};

const MIB: usize = 1024 * 1024;

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("failed to access {path}: {source}")]
    Io { path: String, source: io::Error },
    #[error("invalid argument: {0}")]
    Usage(String),
}

fn cli() -> Command {
    let key = || Arg::new("KEY").required(true);

    Command::new("obsblob")
        .version(clap::crate_version!())
        .about("Blob operations against a Huawei Cloud OBS bucket")
        .arg(
            Arg::new("BUCKET")
                .required(true)
                .help("bucket name or obs://bucket"),
        )
        .subcommand_required(true)
        .subcommand(Command::new("probe").about("Check that the bucket is reachable"))
        .subcommand(
            Command::new("ls")
                .about("List objects")
                .arg(Arg::new("PREFIX").default_value(""))
                .arg(
                    Arg::new("delimiter")
                        .long("delimiter")
                        .short('d')
                        .default_value("/")
                        .help("empty lists recursively"),
                )
                .arg(
                    Arg::new("max-keys")
                        .long("max-keys")
                        .value_parser(clap::value_parser!(u32)),
                )
                .arg(
                    Arg::new("token")
                        .long("token")
                        .help("resume after this continuation token"),
                ),
        )
        .subcommand(Command::new("stat").about("Show object attributes").arg(key()))
        .subcommand(
            Command::new("cat")
                .about("Write object content to stdout")
                .arg(key())
                .arg(
                    Arg::new("start")
                        .long("start")
                        .default_value("0")
                        .value_parser(clap::value_parser!(u64)),
                )
                .arg(
                    Arg::new("count")
                        .long("count")
                        .default_value("0")
                        .value_parser(clap::value_parser!(u64)),
                ),
        )
        .subcommand(
            Command::new("put")
                .about("Upload a file in a single request")
                .arg(key())
                .arg(Arg::new("FILE").required(true))
                .arg(Arg::new("storage-class").long("storage-class"))
                .arg(Arg::new("content-type").long("content-type"))
                .arg(
                    Arg::new("meta")
                        .long("meta")
                        .action(ArgAction::Append)
                        .help("metadata as name=value"),
                ),
        )
        .subcommand(
            Command::new("rm")
                .about("Delete objects")
                .arg(Arg::new("KEY").required(true).num_args(1..)),
        )
        .subcommand(
            Command::new("cp")
                .about("Server-side copy")
                .arg(Arg::new("SOURCE").required(true))
                .arg(Arg::new("DESTINATION").required(true)),
        )
        .subcommand(
            Command::new("upload")
                .about("Upload a file as a multipart upload")
                .arg(key())
                .arg(Arg::new("FILE").required(true))
                .arg(
                    Arg::new("part-size")
                        .long("part-size")
                        .default_value("8")
                        .value_parser(clap::value_parser!(usize))
                        .help("part size in MiB"),
                )
                .arg(
                    Arg::new("workers")
                        .long("workers")
                        .short('w')
                        .default_value("4")
                        .value_parser(clap::value_parser!(usize)),
                ),
        )
        .subcommand(Command::new("expire").about("Abort stale multipart uploads"))
}

fn format_time(time: SystemTime) -> String {
    OffsetDateTime::from(time)
        .format(&Rfc3339)
        .unwrap_or_else(|_| "-".to_string())
}

fn read_file(path: &str) -> Result<Vec<u8>, CliError> {
    std::fs::read(path).map_err(|source| CliError::Io {
        path: path.to_string(),
        source,
    })
}

fn parse_metadata<'a>(
    pairs: impl Iterator<Item = &'a String>,
) -> Result<HashMap<String, String>, CliError> {
    pairs
        .map(|pair| match pair.split_once('=') {
            Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
            _ => Err(CliError::Usage(format!("expected name=value, got: {}", pair))),
        })
        .collect()
}

fn list(backend: &ObsBackend, matches: &ArgMatches) -> Result<(), CliError> {
    let mut input = ListBlobsInput {
        prefix: matches.get_one::<String>("PREFIX").cloned().unwrap_or_default(),
        delimiter: matches.get_one::<String>("delimiter").cloned().unwrap_or_default(),
        max_keys: matches.get_one::<u32>("max-keys").copied(),
        continuation_token: matches.get_one::<String>("token").cloned(),
    };

    loop {
        let page = backend.list_blobs(&input)?;
        for prefix in &page.prefixes {
            println!("{:>29} {:>12}  {}", "", "PRE", prefix);
        }
        for item in &page.items {
            println!(
                "{:>29} {:>12}  {}",
                format_time(item.last_modified),
                item.size,
                item.key
            );
        }

        if !page.is_truncated || page.continuation_token.is_none() {
            return Ok(());
        }
        input.continuation_token = page.continuation_token;
    }
}

fn upload(
    backend: &ObsBackend,
    key: &str,
    path: &str,
    part_size: usize,
    workers: usize,
) -> Result<(), CliError> {
    let data = read_file(path)?;
    if data.is_empty() {
        backend.put_blob(PutBlobInput::from_bytes(key, data))?;
        return Ok(());
    }

    let part_size = part_size.max(5) * MIB;
    let chunks: Vec<&[u8]> = data.chunks(part_size).collect();
    if chunks.len() > backend.capabilities().max_parts as usize {
        return Err(CliError::Usage(format!(
            "{} parts needed but at most {} allowed, raise --part-size",
            chunks.len(),
            backend.capabilities().max_parts
        )));
    }

    let upload = backend.multipart_begin(key, &HashMap::new())?;
    info!(
        key = key,
        upload_id = upload.upload_id(),
        parts = chunks.len(),
        "multipart upload started"
    );

    let next = AtomicUsize::new(0);
    let failure: Mutex<Option<BackendError>> = Mutex::new(None);
    thread::scope(|scope| {
        for _ in 0..workers.max(1) {
            scope.spawn(|| loop {
                let index = next.fetch_add(1, Ordering::Relaxed);
                let failed = failure
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .is_some();
                if index >= chunks.len() || failed {
                    break;
                }

                let body = ByteStream::from(chunks[index].to_vec());
                if let Err(err) = backend.multipart_add(&upload, index as u32 + 1, body) {
                    failure
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .get_or_insert(err);
                    break;
                }
            });
        }
    });

    let result = match failure.into_inner().unwrap_or_else(PoisonError::into_inner) {
        Some(err) => Err(err),
        None => backend.multipart_commit(&upload).map(|out| {
            println!("{} {}", out.etag, key);
        }),
    };

    if let Err(err) = result {
        warn!(
            key = key,
            upload_id = upload.upload_id(),
            error_message = %err,
            "aborting multipart upload"
        );
        if let Err(abort_err) = backend.multipart_abort(&upload) {
            warn!(
                upload_id = upload.upload_id(),
                error_message = %abort_err,
                "failed to abort multipart upload"
            );
        }
        return Err(err.into());
    }

    Ok(())
}

fn run(matches: &ArgMatches) -> Result<(), CliError> {
    let bucket_uri = matches
        .get_one::<String>("BUCKET")
        .ok_or_else(|| CliError::Usage("missing bucket".to_string()))?;
    let bucket = parse_bucket_from_uri(bucket_uri)?;

    let config = BackendConfig::from_env();
    info!(bucket = bucket, config = ?config, "args");
    let backend = ObsBackend::new(bucket, config)?;

    let (command, args) = matches
        .subcommand()
        .ok_or_else(|| CliError::Usage("missing command".to_string()))?;
    let span = span!(Level::INFO, "command", context = command);
    let _e = span.enter();

    let arg = |name: &str| {
        args.get_one::<String>(name)
            .map(String::as_str)
            .ok_or_else(|| CliError::Usage(format!("missing {}", name)))
    };

    match command {
        "probe" => {
            backend.init()?;
            let cap = backend.capabilities();
            println!(
                "{} bucket={} max_multipart_size={} max_parts={}",
                cap.name,
                backend.bucket(),
                cap.max_multipart_size,
                cap.max_parts
            );
        }
        "ls" => list(&backend, args)?,
        "stat" => {
            let head = backend.head_blob(arg("KEY")?)?;
            println!("key:           {}", head.item.key);
            println!("size:          {}", head.item.size);
            println!("etag:          {}", head.item.etag);
            println!("last modified: {}", format_time(head.item.last_modified));
            println!("storage class: {}", head.item.storage_class);
            println!("content type:  {}", head.content_type.as_deref().unwrap_or("-"));
            let mut metadata: Vec<_> = head.metadata.iter().collect();
            metadata.sort();
            for (name, value) in metadata {
                println!("meta:          {}={}", name, value);
            }
        }
        "cat" => {
            let start = args.get_one::<u64>("start").copied().unwrap_or(0);
            let count = args.get_one::<u64>("count").copied().unwrap_or(0);
            let out = backend.get_blob(arg("KEY")?, start, count)?;
            let data = out.body.read_to_end()?;
            io::stdout()
                .write_all(&data)
                .map_err(|source| CliError::Io {
                    path: "stdout".to_string(),
                    source,
                })?;
        }
        "put" => {
            let key = arg("KEY")?;
            let mut input = PutBlobInput::from_bytes(key, read_file(arg("FILE")?)?);
            input.storage_class = args.get_one::<String>("storage-class").cloned();
            input.content_type = args.get_one::<String>("content-type").cloned();
            input.metadata = parse_metadata(args.get_many::<String>("meta").into_iter().flatten())?;
            let out = backend.put_blob(input)?;
            println!("{} {} {}", out.etag, out.storage_class, key);
        }
        "rm" => {
            let keys: Vec<String> = args
                .get_many::<String>("KEY")
                .into_iter()
                .flatten()
                .cloned()
                .collect();
            match keys.as_slice() {
                [key] => {
                    backend.delete_blob(key)?;
                }
                keys => {
                    let out = backend.delete_blobs(keys)?;
                    info!(deleted = out.deleted, "deleted objects");
                }
            }
        }
        "cp" => {
            let out = backend.copy_blob(arg("SOURCE")?, arg("DESTINATION")?, None)?;
            println!("{}", out.etag);
        }
        "upload" => {
            let part_size = args.get_one::<usize>("part-size").copied().unwrap_or(8);
            let workers = args.get_one::<usize>("workers").copied().unwrap_or(4);
            upload(&backend, arg("KEY")?, arg("FILE")?, part_size, workers)?;
        }
        "expire" => {
            let out = backend.multipart_expire()?;
            println!("aborted={} kept={}", out.aborted, out.kept);
        }
        other => return Err(CliError::Usage(format!("unknown command: {}", other))),
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().json().init();

    let span = span!(Level::INFO, "main", context = "main");
    let _e = span.enter();
    info!("called");

    let matches = cli().get_matches();
    match run(&matches) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error_message = %err, error_group = "cli", "command failed");
            ExitCode::FAILURE
        }
    }
}
