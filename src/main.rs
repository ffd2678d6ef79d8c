fn main() {
    let code = match rkr::run::run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("rkr: {:#}", err);
            2
        }
    };
    std::process::exit(code);
}
