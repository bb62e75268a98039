use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    mcpchat::cli::main()
}
