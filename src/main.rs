mod app;
mod logging;

use venv_move::cli;

fn main() {
    let args = cli::parse();
    std::process::exit(app::run(args));
}
