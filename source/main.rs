use clap::Parser as _;
use std::path;

#[derive(clap::Parser)]
#[command(name = "tpop3d", about = "A concurrent POP3 server")]
struct Arguments {
  #[arg(short = 'd', long = "debug", help = "Stay attached to the controlling terminal and log to stderr")]
  debug: bool,
  #[arg(short = 'f', long = "config", help = "Configuration file", default_value = "/etc/tpop3d.conf")]
  config: path::PathBuf,
  #[arg(short = 'P', long = "prompt-passphrase", help = "Prompt for TLS private key pass phrases")]
  prompt_passphrase: bool,
  #[clap(flatten)]
  verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,
}

fn main() -> anyhow::Result<()> {
  let arguments = Arguments::parse();
  tpop3d::run(&tpop3d::Arguments {
    config_path: arguments.config,
    foreground: arguments.debug,
    prompt_passphrase: arguments.prompt_passphrase,
    verbosity: arguments.verbose.log_level_filter(),
  })
}
