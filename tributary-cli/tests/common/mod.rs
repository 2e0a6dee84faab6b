use std::process::Command;

pub fn cli() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("tributary-cli"))
}
