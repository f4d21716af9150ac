// Build script to compile the GLSL compute shaders into one SPIR-V program
//
// Each shader is compiled with its entry point renamed to the kernel name,
// then the modules are linked so the Vulkan backend sees one program with
// several kernels.

use std::path::Path;
use std::process::Command;

const KERNELS: &[(&str, &str)] = &[
    ("shaders/particle_sim.comp", "ParticleSimulation"),
    ("shaders/apply_pulse.comp", "ApplyPulse"),
    ("shaders/array_multiply.comp", "ArrayMultiply"),
];

const PROGRAM: &str = "shaders/particles.spv";

fn main() {
    println!("cargo:rerun-if-changed=shaders/");

    if std::env::var_os("CARGO_FEATURE_VULKAN").is_none() {
        return;
    }

    let mut modules = Vec::new();
    for (input, entry) in KERNELS {
        let output = format!("shaders/{}.spv", entry);
        if compile_shader(input, entry, &output) {
            modules.push(output);
        }
    }

    if modules.len() == KERNELS.len() {
        link_program(&modules, PROGRAM);
    }
}

fn compile_shader(input: &str, entry: &str, output: &str) -> bool {
    let input_path = Path::new(input);
    let output_path = Path::new(output);

    // glslangValidator (part of Vulkan SDK) can rename the GLSL entry point
    let result = Command::new("glslangValidator")
        .arg("-V")
        .arg("--target-env")
        .arg("vulkan1.2")
        .arg("--source-entrypoint")
        .arg("main")
        .arg("-e")
        .arg(entry)
        .arg(input_path)
        .arg("-o")
        .arg(output_path)
        .status();

    match result {
        Ok(status) if status.success() => {
            println!("Compiled {} -> {}", input, output);
            true
        }
        Ok(status) => {
            panic!("Failed to compile {}: exit code {:?}", input, status.code());
        }
        Err(e) => {
            println!("cargo:warning=glslangValidator not found ({})", e);
            println!(
                "cargo:warning=Shaders will not be compiled. Install Vulkan SDK or compile manually:"
            );
            println!(
                "cargo:warning=  glslangValidator -V --source-entrypoint main -e {} {} -o {}",
                entry, input, output
            );
            false
        }
    }
}

fn link_program(modules: &[String], output: &str) {
    let result = Command::new("spirv-link")
        .args(modules)
        .arg("-o")
        .arg(output)
        .status();

    match result {
        Ok(status) if status.success() => {
            println!("Linked {} kernels -> {}", modules.len(), output);
        }
        Ok(status) => {
            panic!("Failed to link {}: exit code {:?}", output, status.code());
        }
        Err(e) => {
            println!("cargo:warning=spirv-link not found ({})", e);
            println!("cargo:warning=  spirv-link {} -o {}", modules.join(" "), output);
        }
    }
}
