// uDashBoard: featherweight dashboard application.
//
// Copyright (C) 2019  Brandon Lewis
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

//! Thin smoke-test binary: run a Sox script from a file path argument, or
//! from stdin when none is given. This is not the collaborator CLI driver
//! described in the surrounding system (argument parsing, REPL, bytecode
//! dump), just enough to exercise the compiler and VM end to end.

use std::io::Read;
use std::process::exit;
use std::{env, fs, io};

use sox::vm::Vm;

fn main() {
    env_logger::init();

    let source = match env::args().nth(1) {
        Some(path) => fs::read_to_string(&path).unwrap_or_else(|e| {
            eprintln!("couldn't read '{}': {}", path, e);
            exit(74);
        }),
        None => {
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf).unwrap_or_else(|e| {
                eprintln!("couldn't read stdin: {}", e);
                exit(74);
            });
            buf
        }
    };

    let mut vm = Vm::new();
    let result = vm.interpret(&source);

    use sox::error::InterpretResult;
    match &result {
        InterpretResult::Ok => {}
        InterpretResult::CompileError(errors) => {
            for e in errors {
                eprintln!("{}", e);
            }
        }
        InterpretResult::RuntimeError(e) => {
            eprintln!("{}", e.render());
        }
    }

    exit(result.exit_code());
}
