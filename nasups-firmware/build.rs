use std::{env, fs, path::PathBuf};

fn main() {
    let out = &PathBuf::from(env::var_os("OUT_DIR").expect("OUT_DIR not set"));

    println!("cargo:rerun-if-changed=memory.x");
    let ld_script = fs::read("memory.x").expect("cannot read memory.x");
    fs::write(out.join("memory.x"), ld_script).expect("cannot write memory.x");

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rustc-link-search={}", out.display());
}
