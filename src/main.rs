fn main() {
    if let Err(err) = shiftclock_lib::run() {
        eprintln!("shiftclock: {err:#}");
        std::process::exit(1);
    }
}
