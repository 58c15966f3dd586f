use std::env;
use std::fs;
use std::io::{self, Write};
use std::process;

use bytelox::{Error, VM};

fn main() {
    let args: Vec<String> = env::args().collect();
    match args.len() {
        1 => repl(),
        2 => run_file(&args[1]),
        _ => {
            eprintln!("Usage: bytelox [path]");
            process::exit(64);
        }
    }
}

/// Read and execute one line at a time, sharing a single machine so
/// globals defined on earlier lines stay visible.
fn repl() {
    let mut vm = VM::default();
    loop {
        print!("> ");
        io::stdout().flush().expect("stdout is writable");

        let mut line = String::new();
        match io::stdin().read_line(&mut line) {
            Ok(0) => {
                println!();
                break;
            }
            Ok(_) => {
                if line.trim().is_empty() {
                    continue;
                }
                // Errors were already reported; the REPL keeps going.
                let _ = vm.interpret(&line);
            }
            Err(err) => {
                eprintln!("Read error: {}", err);
                break;
            }
        }
    }
}

fn run_file(path: &str) {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Could not read file \"{}\": {}", path, err);
            process::exit(74);
        }
    };
    let mut vm = VM::default();
    match vm.interpret(&source) {
        Ok(()) => {}
        Err(Error::Compile) => process::exit(65),
        Err(Error::Runtime) => process::exit(70),
    }
}
