use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;

use anyhow::Context;
use haptlink::config::{ServiceSettings, Settings};
use haptlink::service::CodecService;
use haptlink::signal::Lz4BlockCodec;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    bind: Option<SocketAddr>,
    encode_reply: Option<SocketAddr>,
    decode_reply: Option<SocketAddr>,
    actuators: Option<usize>,
    samples: Option<usize>,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: haptlink-codec-service [options]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --config <file>          JSON settings file");
            eprintln!("  --bind <addr>            Listen address [default: 127.0.0.1:5300]");
            eprintln!("  --encode-reply <addr>    Destination of encode results [default: 127.0.0.1:5301]");
            eprintln!("  --decode-reply <addr>    Destination of decode results [default: 127.0.0.1:5302]");
            eprintln!("  --actuators <n>          Actuators per batch [default: 3]");
            eprintln!("  --samples <n>            Samples per actuator [default: frames x taxels]");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(args) {
        tracing::error!(error = %format!("{e:#}"), "Codec service failed");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args::default();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--config" => parsed.config = Some(PathBuf::from(next_value(args, &mut i, flag)?)),
            "--bind" => parsed.bind = Some(parse_value(flag, next_value(args, &mut i, flag)?)?),
            "--encode-reply" => {
                parsed.encode_reply = Some(parse_value(flag, next_value(args, &mut i, flag)?)?)
            }
            "--decode-reply" => {
                parsed.decode_reply = Some(parse_value(flag, next_value(args, &mut i, flag)?)?)
            }
            "--actuators" => {
                parsed.actuators = Some(parse_value(flag, next_value(args, &mut i, flag)?)?)
            }
            "--samples" => {
                parsed.samples = Some(parse_value(flag, next_value(args, &mut i, flag)?)?)
            }
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(parsed)
}

fn next_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn parse_value<T>(flag: &str, raw: &str) -> Result<T, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e| format!("invalid value '{raw}' for {flag}: {e}"))
}

/// `RUST_LOG` wins; otherwise `HAPTLINK_LOG` picks the level. `LOG_FORMAT=json`
/// switches to JSON lines. Everything goes to stderr.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(default_directives(std::env::var("HAPTLINK_LOG").ok().as_deref()))
    });
    let json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| fmt::layer().with_writer(std::io::stderr)))
        .try_init();
}

fn default_directives(level: Option<&str>) -> String {
    let level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn" | "warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("haptlink={level},haptlink_codec_service={level}")
}

fn settings(args: &Args) -> anyhow::Result<(ServiceSettings, usize)> {
    let settings = match &args.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };

    let mut service = settings.service;
    if let Some(bind) = args.bind {
        service.bind = bind;
    }
    if let Some(addr) = args.encode_reply {
        service.encode_reply = addr;
    }
    if let Some(addr) = args.decode_reply {
        service.decode_reply = addr;
    }
    if let Some(n) = args.actuators {
        service.actuators = n;
    }
    let samples = args
        .samples
        .unwrap_or_else(|| settings.tactile.samples_per_actuator());

    anyhow::ensure!(service.actuators > 0, "--actuators must be at least 1");
    anyhow::ensure!(samples > 0, "--samples must be at least 1");
    Ok((service, samples))
}

fn run(args: Args) -> anyhow::Result<()> {
    let (service, samples) = settings(&args)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(async move {
        let server = CodecService::bind(
            service.bind,
            service.actuators,
            samples,
            service.buffer_size,
            Lz4BlockCodec::new(samples),
        )
        .await
        .context("failed to start codec service")?
        .with_replies(service.encode_reply, service.decode_reply);

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("Received interrupt, shutting down"),
                Err(e) => tracing::warn!(error = %e, "Failed to listen for interrupt"),
            }
            shutdown.cancel();
        });

        server.run(cancel).await;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(rest: &[&str]) -> Vec<String> {
        std::iter::once("haptlink-codec-service")
            .chain(rest.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parses_overrides() {
        let args = parse_args(&argv(&[
            "--bind",
            "0.0.0.0:6000",
            "--actuators",
            "5",
            "--samples",
            "128",
        ]))
        .unwrap();
        assert_eq!(args.bind, Some("0.0.0.0:6000".parse().unwrap()));
        assert_eq!(args.actuators, Some(5));
        assert_eq!(args.samples, Some(128));
        assert!(args.config.is_none());
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_args(&argv(&["--bind"])).unwrap_err().contains("requires a value"));
        assert!(parse_args(&argv(&["--actuators", "many"])).unwrap_err().contains("--actuators"));
        assert!(parse_args(&argv(&["--verbose"])).unwrap_err().contains("unexpected"));
        assert_eq!(parse_args(&argv(&["--help"])).unwrap_err(), "");
    }

    #[test]
    fn log_level_maps_onto_both_crates() {
        assert_eq!(
            default_directives(None),
            "haptlink=info,haptlink_codec_service=info"
        );
        assert_eq!(
            default_directives(Some("warning")),
            "haptlink=warn,haptlink_codec_service=warn"
        );
        assert_eq!(
            default_directives(Some("loud")),
            "haptlink=info,haptlink_codec_service=info"
        );
        assert!(default_directives(Some("debug")).parse::<EnvFilter>().is_ok());
    }

    #[test]
    fn defaults_follow_settings() {
        let (service, samples) = settings(&Args::default()).unwrap();
        assert_eq!(service, ServiceSettings::default());
        assert_eq!(samples, 64 * 8);
    }
}
