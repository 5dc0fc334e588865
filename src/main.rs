use clap::Parser;

use holo::cli::Cli;

fn main() {
    let cli = Cli::parse();
    holo::logging::init(cli.verbose);

    if let Err(err) = holo::run(cli) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}
