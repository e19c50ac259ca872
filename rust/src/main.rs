//! Operator CLI. Diagnostics go to stderr through `tracing`; prompts and
//! results go to stdout.

use std::env;
use std::io::{self, IsTerminal};
use std::process::ExitCode;

use haiot_config::config::{read_config, setup_config, Settings};
use haiot_config::crypto::codec;
use haiot_config::crypto::key::unique_chip_id;
use haiot_config::format::SECRET_TAG;
use haiot_config::prompt::{ConsolePrompter, ScriptedPrompter};
use haiot_config::store::ParamStore;
use tracing_subscriber::EnvFilter;

fn print_usage() {
    eprintln!("Commands:\n  setup\n  show\n  encrypt-secret <plaintext>\n  decrypt-secret <s1-payload>\n  key-fingerprint\n  chip-id\n  self-test");
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn fail(context: &str, err: impl std::fmt::Display) -> ExitCode {
    tracing::error!(op = "cli.fail", error = %err, "{context}");
    eprintln!("{context}: {err}");
    ExitCode::FAILURE
}

fn main() -> ExitCode {
    init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return ExitCode::FAILURE;
    }

    let settings = match Settings::load() {
        Ok(s) => s,
        Err(e) => return fail("settings load failed", e),
    };

    match args[1].as_str() {
        "setup" => {
            if args.len() != 2 {
                print_usage();
                return ExitCode::FAILURE;
            }
            let backend = match settings.open_backend() {
                Ok(b) => b,
                Err(e) => return fail("store open failed", e),
            };
            let interactive = io::stdin().is_terminal();
            let mut store =
                ParamStore::new(backend, ConsolePrompter::stdio(), settings.key_deriver());
            match setup_config(&mut store, interactive, settings.no_reconfigure) {
                Ok(cfg) => print_json(&cfg.redacted_summary()),
                Err(err) => fail("configuration failed", err),
            }
        }
        "show" => {
            if args.len() != 2 {
                print_usage();
                return ExitCode::FAILURE;
            }
            let backend = match settings.open_backend() {
                Ok(b) => b,
                Err(e) => return fail("store open failed", e),
            };
            let mut store =
                ParamStore::new(backend, ScriptedPrompter::default(), settings.key_deriver());
            match read_config(&mut store) {
                Ok(cfg) => print_json(&cfg.redacted_summary()),
                Err(err) => fail("store read failed", err),
            }
        }
        "encrypt-secret" => {
            if args.len() != 3 {
                print_usage();
                return ExitCode::FAILURE;
            }
            let keys = settings.key_deriver();
            let key = match keys.derive() {
                Ok(k) => k,
                Err(e) => return fail("device key unavailable", e),
            };
            match codec::encrypt(key, args[2].as_bytes()) {
                Ok(packet) => {
                    println!("{SECRET_TAG}{packet}");
                    ExitCode::SUCCESS
                }
                Err(err) => fail("encryption failed", err),
            }
        }
        "decrypt-secret" => {
            if args.len() != 3 {
                print_usage();
                return ExitCode::FAILURE;
            }
            let keys = settings.key_deriver();
            let key = match keys.derive() {
                Ok(k) => k,
                Err(e) => return fail("device key unavailable", e),
            };
            let payload = args[2].strip_prefix(SECRET_TAG).unwrap_or(&args[2]);
            match codec::decrypt_string(key, payload) {
                Ok(text) => {
                    println!("{text}");
                    ExitCode::SUCCESS
                }
                Err(err) => fail("decryption failed", err),
            }
        }
        "key-fingerprint" => {
            let keys = settings.key_deriver();
            match keys.derive() {
                Ok(key) => {
                    println!("{}", key.fingerprint());
                    ExitCode::SUCCESS
                }
                Err(err) => fail("device key unavailable", err),
            }
        }
        "chip-id" => match unique_chip_id(&settings.platform_source()) {
            Ok(id) => {
                println!("{id}");
                ExitCode::SUCCESS
            }
            Err(err) => fail("platform identity unavailable", err),
        },
        "self-test" => {
            let keys = settings.key_deriver();
            let key = match keys.derive() {
                Ok(k) => k,
                Err(e) => return fail("device key unavailable", e),
            };
            if codec::self_test(key) {
                println!("ok");
                ExitCode::SUCCESS
            } else {
                println!("failed");
                ExitCode::FAILURE
            }
        }
        _ => {
            print_usage();
            ExitCode::FAILURE
        }
    }
}

fn print_json(value: &serde_json::Value) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(text) => {
            println!("{text}");
            ExitCode::SUCCESS
        }
        Err(err) => fail("summary encoding failed", err),
    }
}
