fn main() {
    if let Err(e) = portmod::run_cli() {
        eprintln!("{e:?}");
        std::process::exit(1);
    }
}
