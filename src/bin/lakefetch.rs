use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    lakefetch::cli::run_cli(std::env::args().skip(1))
}
