use anyhow::Result;

fn main() -> Result<()> {
    let code = runk::cli::run()?;
    std::process::exit(code);
}
