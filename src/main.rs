use anyhow::{Context, Result};
use clap::Parser;

use interview_voice::voice::device::{list_input_devices, list_output_devices};
use interview_voice::voice::types::SessionEvent;
use interview_voice::{AppConfig, InterviewSession};

fn init_logging(json: bool) {
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => tracing_subscriber::EnvFilter::new("warn,interview_voice=info"),
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    // `init` also installs the bridge for `log` records.
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_devices() {
    println!("Input devices:");
    for name in list_input_devices() {
        println!("  {}", name);
    }
    println!("Output devices:");
    for name in list_output_devices() {
        println!("  {}", name);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let app = AppConfig::parse();
    init_logging(app.log_json);

    if app.list_devices {
        print_devices();
        return Ok(());
    }

    let mut session = InterviewSession::new(app.session_config());
    session
        .start_streaming()
        .await
        .context("could not start the interview session")?;

    loop {
        tokio::select! {
            event = session.next_event() => match event {
                Some(SessionEvent::Message(message)) => println!("agent: {}", message.text),
                Some(SessionEvent::Status(status)) => {
                    log::info!("Connection status: {:?}", status);
                }
                Some(SessionEvent::TurnComplete { interrupted }) => {
                    log::debug!("Turn complete (interrupted: {})", interrupted);
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, stopping");
                break;
            }
        }
    }

    session.stop_streaming();
    Ok(())
}
