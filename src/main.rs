fn main() {
    if let Err(err) = csv_lake::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
