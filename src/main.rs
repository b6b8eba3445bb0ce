fn main() -> anyhow::Result<()> {
    canbridge_lib::cli::run()
}
