//! Ensures the crate is recompiled when migration files change, which the
//! `SQLx` `migrate!()` macro relies on to pick up schema changes.

fn main() {
    println!("cargo:rerun-if-changed=migrations");
}
