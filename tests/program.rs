// Program registration, transfers and dispatch on the host backend

use glam::UVec3;
use particle_interop::backend::host::QueueEvent;
use particle_interop::backend::{HostBackend, HostGraphics};
use particle_interop::compute::{
    AccessMode, ComputeContext, ComputeError, KernelArg, Status, VertexBufferFactory,
};
use particle_interop::Program;
use std::sync::Arc;

const ARRAY_MULTIPLY: &[u8] = br#"
__kernel void ArrayMultiply(__global const float* a,
                            __global const float* b,
                            __global float* c)
{
    int i = get_global_id(0);
    c[i] = a[i] * b[i];
}
"#;

struct Fixture {
    backend: Arc<HostBackend>,
    graphics: HostGraphics,
    ctx: Arc<ComputeContext>,
}

fn fixture() -> Fixture {
    let graphics = HostGraphics::new();
    let backend = Arc::new(
        HostBackend::new()
            .with_graphics(&graphics)
            .with_tracing(true),
    );
    let ctx = ComputeContext::initialize(backend.clone(), Some(graphics.share_group())).unwrap();
    Fixture {
        backend,
        graphics,
        ctx,
    }
}

/// Program with a, b, c of `len` floats and ArrayMultiply bound to them.
fn multiply_program(ctx: &Arc<ComputeContext>, len: usize) -> Program {
    let mut program = Program::from_source(ctx, ARRAY_MULTIPLY).unwrap();
    let bytes = len * std::mem::size_of::<f32>();
    program.add_buffer("a", bytes, AccessMode::ReadOnly).unwrap();
    program.add_buffer("b", bytes, AccessMode::ReadOnly).unwrap();
    program.add_buffer("c", bytes, AccessMode::WriteOnly).unwrap();

    let args = ["a", "b", "c"]
        .iter()
        .map(|name| KernelArg::global(program.buffer(name).unwrap()))
        .collect();
    program.add_kernel("ArrayMultiply", args).unwrap();
    program
}

fn dispatches(trace: &[QueueEvent]) -> usize {
    trace
        .iter()
        .filter(|e| matches!(e, QueueEvent::Dispatch { .. }))
        .count()
}

#[test]
fn array_multiply_round_trip() {
    let f = fixture();
    let mut program = multiply_program(&f.ctx, 4);

    program.write_pod("a", &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
    program.write_pod("b", &[2.0f32, 2.0, 2.0, 2.0]).unwrap();
    program
        .execute("ArrayMultiply", UVec3::new(4, 1, 1), UVec3::new(2, 1, 1), 0)
        .unwrap();
    program.flush().unwrap();

    let mut c = [0.0f32; 4];
    program.read_pod("c", &mut c).unwrap();
    assert_eq!(c, [2.0, 4.0, 6.0, 8.0]);
}

#[test]
fn written_bytes_read_back_unchanged() {
    let f = fixture();
    let mut program = Program::from_source(&f.ctx, ARRAY_MULTIPLY).unwrap();
    program.add_buffer("scratch", 64, AccessMode::ReadWrite).unwrap();

    let data: Vec<u8> = (0..64u8).rev().collect();
    program.write_buffer("scratch", &data).unwrap();
    program.flush().unwrap();

    let mut out = vec![0u8; 64];
    program.read_buffer("scratch", &mut out).unwrap();
    assert_eq!(out, data);
}

#[test]
fn duplicate_buffer_name_keeps_the_original() {
    let f = fixture();
    let mut program = Program::from_source(&f.ctx, ARRAY_MULTIPLY).unwrap();
    let first = program.add_buffer("a", 16, AccessMode::ReadOnly).unwrap();

    let err = program.add_buffer("a", 32, AccessMode::ReadWrite).unwrap_err();
    assert!(matches!(err, ComputeError::DuplicateName { ref name, .. } if name == "a"));

    let kept = program.buffer("a").unwrap();
    assert_eq!(kept.handle(), first);
    assert_eq!(kept.size(), 16);
    assert_eq!(kept.access(), AccessMode::ReadOnly);
}

#[test]
fn duplicate_kernel_name_is_rejected() {
    let f = fixture();
    let mut program = multiply_program(&f.ctx, 4);
    let args = ["a", "b", "c"]
        .iter()
        .map(|name| KernelArg::global(program.buffer(name).unwrap()))
        .collect();

    let err = program.add_kernel("ArrayMultiply", args).unwrap_err();
    assert!(matches!(err, ComputeError::DuplicateName { .. }));
    assert_eq!(program.kernel_names(), vec!["ArrayMultiply"]);
}

#[test]
fn unknown_kernel_dispatches_nothing() {
    let f = fixture();
    let mut program = multiply_program(&f.ctx, 4);
    f.backend.take_trace();

    let err = program
        .execute("Missing", UVec3::new(4, 1, 1), UVec3::new(2, 1, 1), 0)
        .unwrap_err();
    assert!(matches!(err, ComputeError::MissingResource { ref name, .. } if name == "Missing"));
    assert_eq!(dispatches(&f.backend.take_trace()), 0);
    assert!(program.kernel_timing("Missing").is_none());
}

#[test]
fn entry_point_absent_from_source_fails_to_compile() {
    let f = fixture();
    let mut program = Program::from_source(&f.ctx, ARRAY_MULTIPLY).unwrap();
    program.add_buffer("a", 16, AccessMode::ReadOnly).unwrap();

    let args = vec![KernelArg::global(program.buffer("a").unwrap())];
    let err = program.add_kernel("NotThere", args).unwrap_err();
    assert_eq!(err.status(), Some(Status::InvalidKernelName));
    assert!(program.kernel("NotThere").is_err());
}

#[test]
fn size_mismatch_leaves_buffer_untouched() {
    let f = fixture();
    let mut program = Program::from_source(&f.ctx, ARRAY_MULTIPLY).unwrap();
    program.add_buffer("a", 16, AccessMode::ReadWrite).unwrap();
    program.write_pod("a", &[7.0f32; 4]).unwrap();

    let err = program.write_pod("a", &[1.0f32; 3]).unwrap_err();
    match err {
        ComputeError::SizeMismatch {
            name,
            expected,
            actual,
        } => {
            assert_eq!(name, "a");
            assert_eq!(expected, 16);
            assert_eq!(actual, 12);
        }
        other => panic!("unexpected error: {}", other),
    }

    let mut short = [0.0f32; 5];
    assert!(matches!(
        program.read_pod("a", &mut short),
        Err(ComputeError::SizeMismatch { .. })
    ));

    let mut out = [0.0f32; 4];
    program.read_pod("a", &mut out).unwrap();
    assert_eq!(out, [7.0; 4]);
}

#[test]
fn reading_a_write_only_buffer_still_works() {
    let f = fixture();
    let mut program = Program::from_source(&f.ctx, ARRAY_MULTIPLY).unwrap();
    program.add_buffer("out", 8, AccessMode::WriteOnly).unwrap();
    program.write_buffer("out", &[3u8; 8]).unwrap();

    let mut out = [0u8; 8];
    program.read_buffer("out", &mut out).unwrap();
    assert_eq!(out, [3u8; 8]);
}

#[test]
fn missing_buffer_is_reported_by_name() {
    let f = fixture();
    let program = Program::from_source(&f.ctx, ARRAY_MULTIPLY).unwrap();

    let err = program.buffer("ghost").unwrap_err();
    assert!(matches!(err, ComputeError::MissingResource { ref name, .. } if name == "ghost"));
    assert!(!err.is_fatal());
    assert!(program.write_buffer("ghost", &[0u8; 4]).is_err());
}

#[test]
fn acquiring_a_plain_buffer_is_refused() {
    let f = fixture();
    let mut program = Program::from_source(&f.ctx, ARRAY_MULTIPLY).unwrap();
    program.add_buffer("plain", 16, AccessMode::ReadWrite).unwrap();
    f.backend.take_trace();

    let err = program.enqueue_acquire_graphics("plain").unwrap_err();
    assert!(matches!(err, ComputeError::NotInteropBuffer(ref name) if name == "plain"));
    assert!(!f
        .backend
        .take_trace()
        .iter()
        .any(|e| matches!(e, QueueEvent::Acquire { .. })));
}

#[test]
fn malformed_source_returns_the_build_log() {
    let f = fixture();
    let source = b"__kernel void Broken(__global float* a {\n    a[0] = 1.0f;\n";

    let err = match Program::from_source(&f.ctx, source) {
        Err(err) => err,
        Ok(_) => panic!("malformed source built"),
    };
    match &err {
        ComputeError::CompileFailure { log } => {
            assert!(log.contains("error"), "log: {}", log);
            assert!(log.starts_with("<source>:"), "log: {}", log);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(err.is_fatal());
}

#[test]
fn missing_source_file_is_an_io_error() {
    let f = fixture();
    let err = match Program::from_file(&f.ctx, "does/not/exist.cl") {
        Err(err) => err,
        Ok(_) => panic!("built from a missing file"),
    };
    assert!(matches!(err, ComputeError::Io { .. }));
}

#[test]
fn kernels_follow_a_recreated_buffer() {
    let f = fixture();
    let mut program = multiply_program(&f.ctx, 4);
    let old = program.buffer("c").unwrap().handle();

    let new = program.recreate_buffer("c", 8 * 4).unwrap();
    assert_ne!(old, new);
    assert_eq!(program.kernel("ArrayMultiply").unwrap().args()[2].buffer(), Some(new));

    program.write_pod("a", &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
    program.write_pod("b", &[3.0f32; 4]).unwrap();
    program
        .execute("ArrayMultiply", UVec3::new(8, 1, 1), UVec3::new(4, 1, 1), 0)
        .unwrap();
    program.flush().unwrap();

    let mut c = [f32::NAN; 8];
    program.read_pod("c", &mut c).unwrap();
    assert_eq!(c, [3.0, 6.0, 9.0, 12.0, 0.0, 0.0, 0.0, 0.0]);
}

#[test]
fn bound_buffers_cannot_be_removed() {
    let f = fixture();
    let mut program = multiply_program(&f.ctx, 4);
    program.add_buffer("spare", 4, AccessMode::ReadWrite).unwrap();

    let err = program.remove_buffer("a").unwrap_err();
    assert_eq!(err.status(), Some(Status::InvalidOperation));
    assert!(program.buffer("a").is_ok());

    program.remove_buffer("spare").unwrap();
    assert!(program.buffer("spare").is_err());
    assert_eq!(program.buffer_names(), vec!["a", "b", "c"]);
}

#[test]
fn uneven_work_groups_are_rejected() {
    let f = fixture();
    let mut program = multiply_program(&f.ctx, 4);

    let err = program
        .execute("ArrayMultiply", UVec3::new(4, 1, 1), UVec3::new(3, 1, 1), 0)
        .unwrap_err();
    assert_eq!(err.status(), Some(Status::InvalidWorkGroupSize));
}

#[test]
fn kernel_timing_counts_dispatches() {
    let f = fixture();
    let mut program = multiply_program(&f.ctx, 4);
    assert!(program.kernel_timing("ArrayMultiply").is_none());

    for _ in 0..3 {
        program
            .execute("ArrayMultiply", UVec3::new(4, 1, 1), UVec3::new(4, 1, 1), 0)
            .unwrap();
    }

    let timing = program.kernel_timing("ArrayMultiply").unwrap();
    assert_eq!(timing.dispatches, 3);
    assert!(timing.average() <= timing.total);
    assert_eq!(program.total_execution_time(), timing.total);
}

#[test]
fn execute_rebinds_then_dispatches() {
    let f = fixture();
    let mut program = multiply_program(&f.ctx, 4);
    f.backend.take_trace();

    program
        .execute("ArrayMultiply", UVec3::new(4, 1, 1), UVec3::new(1, 1, 1), 0)
        .unwrap();

    let trace = f.backend.take_trace();
    assert_eq!(
        trace,
        vec![
            QueueEvent::Finish,
            QueueEvent::Dispatch {
                kernel: "ArrayMultiply".to_string(),
                global: [4, 1, 1],
            },
        ]
    );
}

#[test]
fn shared_buffer_needs_acquire_before_compute_writes() {
    let f = fixture();
    let vertex = f.graphics.create_vertex_buffer("shared", 16).unwrap();

    let mut program = Program::from_source(&f.ctx, ARRAY_MULTIPLY).unwrap();
    program
        .add_interop_buffer("shared", AccessMode::ReadWrite, vertex)
        .unwrap();
    assert!(program.buffer("shared").unwrap().is_graphics_attached());

    let err = program.write_pod("shared", &[1.0f32; 4]).unwrap_err();
    assert_eq!(err.status(), Some(Status::GraphicsObjectNotAcquired));

    program.enqueue_acquire_graphics("shared").unwrap();
    assert!(f.graphics.is_compute_owned(vertex));
    program.write_pod("shared", &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
    program.flush().unwrap();

    let mut seen = [0.0f32; 4];
    assert!(f.graphics.read_vertex_pod(vertex, &mut seen).is_err());

    program.enqueue_release_graphics("shared").unwrap();
    assert!(!f.graphics.is_compute_owned(vertex));
    f.graphics.read_vertex_pod(vertex, &mut seen).unwrap();
    assert_eq!(seen, [1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn double_acquire_is_an_error() {
    let f = fixture();
    let vertex = f.graphics.create_vertex_buffer("shared", 16).unwrap();
    let mut program = Program::from_source(&f.ctx, ARRAY_MULTIPLY).unwrap();
    program
        .add_interop_buffer("shared", AccessMode::ReadWrite, vertex)
        .unwrap();

    program.enqueue_acquire_graphics("shared").unwrap();
    let err = program.enqueue_acquire_graphics("shared").unwrap_err();
    assert_eq!(err.status(), Some(Status::InvalidOperation));
    program.enqueue_release_graphics("shared").unwrap();
}

#[test]
fn debug_toggle_does_not_change_the_error() {
    let f = fixture();
    f.ctx.set_debug_errors(false);
    let mut program = multiply_program(&f.ctx, 4);

    let err = program
        .execute("ArrayMultiply", UVec3::new(4, 1, 1), UVec3::new(3, 1, 1), 0)
        .unwrap_err();
    assert_eq!(err.status(), Some(Status::InvalidWorkGroupSize));
}
