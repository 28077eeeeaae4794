use clap::Parser;
use log::info;
use rcon::RconClient;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Game server host
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Game server port
    #[arg(short, long, default_value = "29070")]
    port: u16,

    /// Rcon password; omit to send a bare console command
    #[arg(short = 'w', long)]
    password: Option<String>,

    /// Command to send
    #[arg(required = true, trailing_var_arg = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let command = args.command.join(" ");

    let client = RconClient::new(&args.host, args.port, args.password.as_deref().unwrap_or(""));
    info!("Sending '{}' to {}", command, client.server_addr());

    let response = match args.password {
        Some(_) => client.rcon(&command).await,
        None => client.console(&command).await,
    };

    if response.is_empty() {
        eprintln!("No response from {}", client.server_addr());
    } else {
        println!("{}", response);
    }

    Ok(())
}
