//! Console reporting: which commands run, what the build did, without any
//! overprinting cleverness.

pub struct ConsoleProgress {
    /// Print full command lines as they start.
    verbose: bool,
    /// The name of the last command printed, to avoid repeating it when a
    /// command both starts and finishes with no output between.
    last_printed: Option<String>,
}

impl ConsoleProgress {
    pub fn new(verbose: bool) -> ConsoleProgress {
        ConsoleProgress {
            verbose,
            last_printed: None,
        }
    }

    pub fn command_started(&mut self, name: &str) {
        println!("{}", name);
        self.last_printed = Some(name.to_string());
    }

    pub fn command_finished(&mut self, name: &str, status: i32) {
        if status != 0 {
            println!("rkr: {} exited with status {}", name, status);
        } else if self.verbose && self.last_printed.as_deref() != Some(name) {
            println!("rkr: {} done", name);
        }
    }

    pub fn log(&mut self, msg: &str) {
        println!("{}", msg);
    }

    /// End-of-build summary line.
    pub fn summary(&mut self, ran: usize, dry_run: bool) {
        if ran == 0 {
            println!("rkr: No changes detected");
        } else if dry_run {
            println!(
                "rkr: would run {} command{}",
                ran,
                if ran == 1 { "" } else { "s" }
            );
        } else {
            println!(
                "rkr: ran {} command{}, now up to date",
                ran,
                if ran == 1 { "" } else { "s" }
            );
        }
    }
}
