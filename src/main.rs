use anyhow::Result;

use busprobe::{boot, cli};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli::parse_args();
    boot::init_logger(matches.get_one::<String>("log-file").map(String::as_str));

    let code = cli::run(&matches).await?;
    std::process::exit(code);
}
