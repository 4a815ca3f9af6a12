use anyhow::Result;

fn main() -> Result<()> {
    runj::cli::run()
}
