mod ast;
mod cli;
mod codegen;
mod elf_gen;

use std::env;
use std::process;

use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() {
        eprintln!("usage: sh2elf <script.sh> [-o <output>]");
        process::exit(1);
    }

    let input = args[0].clone();
    let mut output = String::from("a.out");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-o" if i + 1 < args.len() => {
                output = args[i + 1].clone();
                i += 2;
            }
            other => {
                eprintln!("unknown arg: {}", other);
                process::exit(1);
            }
        }
    }

    if let Err(e) = cli::compile_file_to_executable(&input, &output) {
        eprintln!("{e:#}");
        process::exit(1);
    }

    eprintln!("wrote ELF64 x86_64 to {}", output);
}
