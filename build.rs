fn main() {
    let out_dir = std::env::var("OUT_DIR").expect("OUT_DIR not set by cargo");

    protobuf_codegen_pure::Codegen::new()
        .out_dir(&out_dir)
        .inputs(["protos/mumble.proto"])
        .include("protos")
        .run()
        .expect("protobuf code generation failed");

    // The generated file is spliced into src/proto/mod.rs via `include!`,
    // which does not permit inner attributes or inner doc comments. Strip
    // them here since they only affect lints/docs, not behavior.
    let generated_path = std::path::Path::new(&out_dir).join("mumble.rs");
    let contents = std::fs::read_to_string(&generated_path).expect("failed to read generated mumble.rs");
    let cleaned: String = contents
        .lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            !trimmed.starts_with("#![") && !trimmed.starts_with("//!")
        })
        .collect::<Vec<_>>()
        .join("\n");
    std::fs::write(&generated_path, cleaned).expect("failed to rewrite generated mumble.rs");

    println!("cargo:rerun-if-changed=protos/mumble.proto");
}
