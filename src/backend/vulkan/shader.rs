// SPIR-V program loading
//
// A compute program is one SPIR-V module holding any number of GLCompute
// entry points; each entry point is a kernel. Arguments map to storage
// buffer bindings in set 0 (binding = argument index), and work-group
// scratch arguments map to specialization constant `LOCAL_ARG_CONSTANT_BASE
// + index` carrying the byte size.

use super::device::VulkanDevice;
use super::status_from;
use crate::compute::error::Status;
use ash::vk;
use std::io::Cursor;

/// Specialization constants 0..=2 hold the work-group size.
pub const LOCAL_SIZE_CONSTANT_IDS: [u32; 3] = [0, 1, 2];
pub const LOCAL_ARG_CONSTANT_BASE: u32 = 3;

const SPIRV_HEADER_WORDS: usize = 5;
const OP_ENTRY_POINT: u32 = 15;
const EXECUTION_MODEL_GL_COMPUTE: u32 = 5;

/// Decode SPIR-V bytes into words, with a readable message on failure.
pub fn load_words(code: &[u8]) -> Result<Vec<u32>, String> {
    ash::util::read_spv(&mut Cursor::new(code))
        .map_err(|e| format!("error: not a valid SPIR-V module: {}", e))
}

/// Names of the compute entry points declared in a SPIR-V module.
pub fn compute_entry_points(words: &[u32]) -> Result<Vec<String>, String> {
    if words.len() < SPIRV_HEADER_WORDS {
        return Err("error: SPIR-V module is truncated".to_string());
    }

    let mut names = Vec::new();
    let mut at = SPIRV_HEADER_WORDS;
    while at < words.len() {
        let word_count = (words[at] >> 16) as usize;
        let opcode = words[at] & 0xffff;
        if word_count == 0 || at + word_count > words.len() {
            return Err(format!("error: malformed instruction at word {}", at));
        }

        if opcode == OP_ENTRY_POINT && word_count > 3 {
            let model = words[at + 1];
            if model == EXECUTION_MODEL_GL_COMPUTE {
                names.push(literal_string(&words[at + 3..at + word_count]));
            }
        }
        at += word_count;
    }

    if names.is_empty() {
        return Err("error: module declares no compute entry points".to_string());
    }
    Ok(names)
}

fn literal_string(words: &[u32]) -> String {
    let bytes: Vec<u8> = words
        .iter()
        .flat_map(|w| w.to_le_bytes())
        .take_while(|b| *b != 0)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Create a shader module from decoded SPIR-V words
pub fn create_shader_module(device: &VulkanDevice, code: &[u32]) -> Result<vk::ShaderModule, Status> {
    let create_info = vk::ShaderModuleCreateInfo::default().code(code);

    unsafe { device.device.create_shader_module(&create_info, None) }.map_err(status_from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name_words(name: &str) -> Vec<u32> {
        let mut bytes = name.as_bytes().to_vec();
        bytes.push(0);
        while bytes.len() % 4 != 0 {
            bytes.push(0);
        }
        bytes
            .chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    fn entry_point(model: u32, id: u32, name: &str) -> Vec<u32> {
        let name = name_words(name);
        let count = 3 + name.len() as u32;
        let mut words = vec![(count << 16) | OP_ENTRY_POINT, model, id];
        words.extend(name);
        words
    }

    fn module(body: &[Vec<u32>]) -> Vec<u32> {
        let mut words = vec![0x0723_0203, 0x0001_0300, 0, 16, 0];
        for inst in body {
            words.extend(inst);
        }
        words
    }

    #[test]
    fn finds_compute_entry_points_only() {
        let words = module(&[
            entry_point(EXECUTION_MODEL_GL_COMPUTE, 1, "ParticleSimulation"),
            entry_point(0, 2, "vertex_main"),
            entry_point(EXECUTION_MODEL_GL_COMPUTE, 3, "ApplyPulse"),
        ]);

        let names = compute_entry_points(&words).unwrap();
        assert_eq!(names, vec!["ParticleSimulation", "ApplyPulse"]);
    }

    #[test]
    fn module_without_kernels_is_rejected() {
        let words = module(&[entry_point(0, 2, "vertex_main")]);
        let log = compute_entry_points(&words).unwrap_err();
        assert!(log.contains("no compute entry points"));
    }

    #[test]
    fn truncated_instruction_is_rejected() {
        let mut words = module(&[entry_point(EXECUTION_MODEL_GL_COMPUTE, 1, "Kernel")]);
        words.pop();
        assert!(compute_entry_points(&words).is_err());
    }

    #[test]
    fn garbage_bytes_are_not_spirv() {
        assert!(load_words(b"__kernel void f() {}").is_err());
    }
}
