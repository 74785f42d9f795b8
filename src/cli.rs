use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "vidra")]
#[command(author, version, about = "Telegram bot that downloads videos and audio via yt-dlp", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the bot in normal mode
    Run,

    /// Probe a URL and print the format catalog without starting the bot
    Probe {
        /// URL to probe
        url: String,

        /// Print the raw catalog as JSON
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
