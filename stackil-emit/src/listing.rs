//! Textual listings of verified and finalized streams
//!
//! Provides two output formats:
//! - Compact: one instruction per line
//! - Verbose: indices or offsets, label marks, region boundaries, and
//!   per-instruction stack or flag comments
//!
//! ## Example
//!
//! ```ignore
//! let text = Listing::new().show_stacks(false).program(&program);
//! ```

use crate::finalize::{FinalizedStream, Operand, ResolvedTarget};
use crate::program::Program;
use crate::regions::HandlerKind;
use stackil_bytecode::core::instructions::Op;
use stackil_bytecode::core::opcodes::InstructionFlags;
use std::fmt::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingFormat {
    /// "ldc.i4 42"
    Compact,

    /// "0003: ldc.i4 42        // [] -> [int32]"
    Verbose,
}

#[derive(Debug, Clone)]
pub struct ListingConfig {
    pub format: ListingFormat,
    pub show_addresses: bool,
    pub show_stacks: bool,
    pub show_flags: bool,
    pub show_metadata: bool,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            format: ListingFormat::Verbose,
            show_addresses: true,
            show_stacks: true,
            show_flags: true,
            show_metadata: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Listing {
    config: ListingConfig,
}

impl Listing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_format(format: ListingFormat) -> Self {
        Self {
            config: ListingConfig {
                format,
                ..Default::default()
            },
        }
    }

    pub fn show_addresses(mut self, show: bool) -> Self {
        self.config.show_addresses = show;
        self
    }

    pub fn show_stacks(mut self, show: bool) -> Self {
        self.config.show_stacks = show;
        self
    }

    pub fn show_flags(mut self, show: bool) -> Self {
        self.config.show_flags = show;
        self
    }

    pub fn show_metadata(mut self, show: bool) -> Self {
        self.config.show_metadata = show;
        self
    }

    pub fn config(&self) -> &ListingConfig {
        &self.config
    }

    /// List a verified stream before optimization output is resolved
    pub fn program(&self, program: &Program) -> String {
        match self.config.format {
            ListingFormat::Compact => self.program_compact(program),
            ListingFormat::Verbose => self.program_verbose(program),
        }
    }

    /// List a resolved stream
    pub fn finalized(&self, stream: &FinalizedStream) -> String {
        match self.config.format {
            ListingFormat::Compact => self.finalized_compact(stream),
            ListingFormat::Verbose => self.finalized_verbose(stream),
        }
    }

    fn program_compact(&self, program: &Program) -> String {
        let mut output = String::new();
        for index in 0..program.len() {
            for label in program.labels().iter().filter(|l| l.position == Some(index)) {
                let _ = writeln!(output, "{}:", label.name);
            }
            let _ = writeln!(output, "{}", display_op(program, index));
        }
        output
    }

    fn program_verbose(&self, program: &Program) -> String {
        let mut output = String::new();

        if self.config.show_metadata {
            let signature = program.signature();
            let ret = signature
                .ret
                .as_ref()
                .map(|ty| ty.to_string())
                .unwrap_or_else(|| "void".to_string());
            let params: Vec<String> = signature.params.iter().map(|p| p.to_string()).collect();
            let _ = writeln!(output, "Method: {ret} ({})", params.join(", "));
            let _ = writeln!(output, "Instructions: {}\n", program.len());

            if !program.locals().is_empty() {
                output.push_str("Locals:\n");
                for local in program.locals() {
                    let _ = writeln!(output, "  [{}] {} {}", local.slot, local.ty, local.name);
                }
                output.push('\n');
            }
        }

        output.push_str("Code:\n");
        for (index, entry) in program.entries().iter().enumerate() {
            self.region_marks(&mut output, program, index);
            for label in program.labels().iter().filter(|l| l.position == Some(index)) {
                let _ = writeln!(output, "  {}:", label.name);
            }

            let mut line = String::from("    ");
            if self.config.show_addresses {
                let _ = write!(line, "{index:04}: ");
            }
            line.push_str(&display_op(program, index));
            let mut notes = Vec::new();
            if self.config.show_stacks {
                notes.push(format!("{} -> {}", entry.stack_before, entry.stack_after));
            }
            if self.config.show_flags && entry.is(InstructionFlags::IMPLICIT) {
                notes.push("implicit".to_string());
            }
            if !notes.is_empty() {
                let _ = write!(line, "{:width$}// {}", "", notes.join("; "), width = pad(&line));
            }
            let _ = writeln!(output, "{}", line.trim_end());
        }
        self.region_marks(&mut output, program, program.len());
        output
    }

    fn region_marks(&self, output: &mut String, program: &Program, index: usize) {
        let handlers = program.handlers();
        let bodies = protected_bodies(program);
        for handler in handlers.iter().filter(|h| h.handler_end == index) {
            let _ = writeln!(output, "  }} // end {}", handler_name(&handler.kind));
        }
        for _ in bodies.iter().filter(|body| body.1 == index) {
            output.push_str("  } // end try\n");
        }
        let mut starting: Vec<&(usize, usize)> =
            bodies.iter().filter(|body| body.0 == index).collect();
        // Wider bodies enclose narrower ones that start at the same index.
        starting.sort_by(|a, b| b.1.cmp(&a.1));
        for _ in starting {
            output.push_str("  .try {\n");
        }
        for handler in handlers.iter().filter(|h| h.handler_start == index) {
            let _ = writeln!(output, "  {} {{", handler_name(&handler.kind));
        }
    }

    fn finalized_compact(&self, stream: &FinalizedStream) -> String {
        let mut output = String::new();
        for instruction in &stream.instructions {
            if instruction.is_tail_call() {
                output.push_str("tail. ");
            }
            output.push_str(instruction.opcode.mnemonic());
            let operand = display_operand(&instruction.operand);
            if !operand.is_empty() {
                output.push(' ');
                output.push_str(&operand);
            }
            output.push('\n');
        }
        output
    }

    fn finalized_verbose(&self, stream: &FinalizedStream) -> String {
        let mut output = String::new();

        if self.config.show_metadata {
            let _ = writeln!(output, "Instructions: {}", stream.len());
            let _ = writeln!(output, "Code size: {} bytes", stream.code_size);
            let _ = writeln!(output, "Max stack: {}\n", stream.max_stack);

            if !stream.locals.is_empty() {
                output.push_str("Locals:\n");
                for (slot, ty) in stream.locals.iter().enumerate() {
                    let _ = writeln!(output, "  [{slot}] {ty}");
                }
                output.push('\n');
            }
        }

        output.push_str("Code:\n");
        for instruction in &stream.instructions {
            let mut line = String::from("  ");
            if self.config.show_addresses {
                let _ = write!(line, "IL_{:04x}: ", instruction.offset);
            }
            if instruction.is_tail_call() {
                line.push_str("tail. ");
            }
            line.push_str(instruction.opcode.mnemonic());
            let operand = display_operand(&instruction.operand);
            if !operand.is_empty() {
                line.push(' ');
                line.push_str(&operand);
            }
            if self.config.show_flags {
                let flags = flag_names(instruction.flags);
                if !flags.is_empty() {
                    let _ = write!(line, "{:width$}// {}", "", flags.join(", "), width = pad(&line));
                }
            }
            let _ = writeln!(output, "{}", line.trim_end());
        }

        if self.config.show_metadata && !stream.handlers.is_empty() {
            output.push_str("\nHandlers:\n");
            for handler in &stream.handlers {
                let _ = writeln!(
                    output,
                    "  {:<24} try IL_{:04x}..IL_{:04x} handler IL_{:04x}..IL_{:04x}",
                    handler_name(&handler.kind),
                    handler.try_offset,
                    handler.try_offset + handler.try_length,
                    handler.handler_offset,
                    handler.handler_offset + handler.handler_length,
                );
            }
        }
        output
    }
}

fn pad(line: &str) -> usize {
    40usize.saturating_sub(line.len()).max(1)
}

/// Protected body ranges. A finally that follows catches guards them too, so
/// its try range ends where a sibling handler ends and is not a body.
fn protected_bodies(program: &Program) -> Vec<(usize, usize)> {
    let handlers = program.handlers();
    let mut bodies = Vec::new();
    for handler in handlers {
        let guards_handler = handlers.iter().any(|other| {
            other.try_start == handler.try_start && other.handler_end == handler.try_end
        });
        let range = (handler.try_start, handler.try_end);
        if !guards_handler && !bodies.contains(&range) {
            bodies.push(range);
        }
    }
    bodies
}

fn handler_name(kind: &HandlerKind) -> String {
    match kind {
        HandlerKind::Catch(filter) => format!("catch {filter}"),
        HandlerKind::Finally => "finally".to_string(),
    }
}

/// Instruction text with label handles replaced by label names
fn display_op(program: &Program, index: usize) -> String {
    let entry = &program.entries()[index];
    let op = &entry.instruction.op;
    let targets = op.branch_targets();
    if targets.is_empty() {
        return op.to_string();
    }
    let names: Vec<&str> = targets.iter().map(|&l| program.label_name(l)).collect();
    let mnemonic = op.opcode().mnemonic();
    if names.len() == 1 && !matches!(op, Op::Switch(_)) {
        format!("{mnemonic} {}", names[0])
    } else {
        format!("{mnemonic} ({})", names.join(", "))
    }
}

fn display_target(target: &ResolvedTarget) -> String {
    format!("{} (IL_{:04x}, {:+})", target.label, target.offset, target.displacement)
}

fn display_operand(operand: &Operand) -> String {
    match operand {
        Operand::None => String::new(),
        Operand::Int32(value) => value.to_string(),
        Operand::Int64(value) => value.to_string(),
        Operand::Float32(value) => value.to_string(),
        Operand::Float64(value) => value.to_string(),
        Operand::String(text) => format!("{text:?}"),
        Operand::Local(slot) => format!("V_{slot}"),
        Operand::Argument(index) => index.to_string(),
        Operand::Field(field) => field.to_string(),
        Operand::Type(ty) => ty.to_string(),
        Operand::Class(ty) => ty.to_string(),
        Operand::Method(method) => method.to_string(),
        Operand::Signature(sig) => {
            let params: Vec<String> = sig.params.iter().map(|p| p.to_string()).collect();
            let ret = sig
                .ret
                .as_ref()
                .map(|ty| ty.to_string())
                .unwrap_or_else(|| "void".to_string());
            format!("{ret}({})", params.join(", "))
        }
        Operand::Branch(target) => display_target(target),
        Operand::Switch(targets) => {
            let targets: Vec<String> = targets.iter().map(display_target).collect();
            format!("({})", targets.join(", "))
        }
    }
}

fn flag_names(flags: InstructionFlags) -> Vec<&'static str> {
    let mut names = Vec::new();
    if flags.contains(InstructionFlags::SHORT_FORM) {
        names.push("short");
    }
    if flags.contains(InstructionFlags::TAIL_CALL) {
        names.push("tail");
    }
    if flags.contains(InstructionFlags::BRANCH_TARGET) {
        names.push("target");
    }
    if flags.contains(InstructionFlags::IMPLICIT) {
        names.push("implicit");
    }
    names
}
