// Embedded migrations are only re-read by `sqlx::migrate!()` when cargo
// reruns the build for changes under ./migrations.
fn main() {
    println!("cargo:rerun-if-changed=migrations");
}
