use anyhow::Result;

fn main() -> Result<()> {
    enclave_init::cli::run(enclave_init::cli::CliMode::Entrypoint)
}
