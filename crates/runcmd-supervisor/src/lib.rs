//! Execution bookkeeping for the managed script.
//!
//! - [`sequence_guard`] makes `enable` idempotent per configuration version.
//! - [`process_marker`] records which handler process owns the active execution and
//!   terminates a stale one left behind by a previous invocation.
//! - [`script_runner`] materializes and runs the script with its output captured to files.

pub mod process_marker;
pub mod script_runner;
pub mod sequence_guard;

pub use process_marker::{
    become_process_group_leader, delete_current_pid_and_start_time, kill_previous_extension,
    process_start_time, save_current_pid_and_start_time, PreviousExecution, ProcessMarker,
    ProcessMarkerGuard,
};
pub use script_runner::{
    output_paths, run_script, save_script_file, ScriptExit, ScriptInvocation, STDERR_FILE_NAME,
    STDOUT_FILE_NAME,
};
pub use sequence_guard::{check_and_advance, read_sequence_number, SequenceDecision};
