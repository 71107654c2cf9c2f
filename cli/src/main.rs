use std::collections::BTreeMap;
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;

use anyhow::{Context, Result};
use argh::FromArgs;
use asm6502::{AsmError, Code, CompileError, CompileOptions, OptLevel, ParserError, Span, Warning};
use console::{style, StyledObject};
use unicode_width::UnicodeWidthStr;

use crate::util::*;

mod util;

fn main() -> ExitCode {
    let app: App = argh::from_env();
    if app.version {
        println!("asm6502c {VERSION}");
        return ExitCode::SUCCESS;
    }

    init_logger();

    let res = match app.cmd {
        Some(Cmd::Build(cmd)) => cmd.run(),
        Some(Cmd::Encode(cmd)) => cmd.run(),
        None => Err(anyhow::anyhow!("No command specified, see `asm6502c --help`")),
    };

    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e:?}");
            ExitCode::FAILURE
        }
    }
}

fn init_logger() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));

    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to set up logging: {e}");
    }
}

/// 6502 assembly compiler
#[derive(FromArgs)]
struct App {
    #[argh(subcommand)]
    cmd: Option<Cmd>,
    /// print version information and exit
    #[argh(switch, short = 'v')]
    version: bool,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Cmd {
    Build(CmdBuild),
    Encode(CmdEncode),
}

/// Compiles an .s file into a textual IR module
#[derive(FromArgs)]
#[argh(subcommand, name = "build")]
struct CmdBuild {
    /// path to the input file with assembly code
    #[argh(positional)]
    input: PathBuf,
    /// optional path to the output file
    #[argh(option, short = 'o')]
    out: Option<PathBuf>,
    /// prune blocks which are never entered
    #[argh(switch)]
    opt: bool,
    /// name of the produced module
    #[argh(option)]
    module_name: Option<String>,
    /// output format: `ll` (default), `clif` or `obj`
    #[argh(option, default = "Emit::Ll")]
    emit: Emit,
    /// output build info as JSON by default
    #[argh(switch)]
    json: bool,
}

impl CmdBuild {
    fn run(self) -> Result<()> {
        let code = read_source(&self.input)?;

        let out = match self.out {
            Some(path) => path,
            None => {
                let mut out = self.input.clone();
                out.set_extension(self.emit.extension());
                out
            }
        };
        anyhow::ensure!(self.input != out, "Output file must not be an input file");

        let source = Source::new(&self.input, &code);

        let parsed = Code::parse(&code);
        if !parsed.parser_errors().is_empty() {
            source.print_parser_errors(parsed.parser_errors());
            source.print_asm_errors(&parsed.check());
            anyhow::bail!("Build failed");
        }

        let mut options = CompileOptions::default();
        if let Some(name) = self.module_name {
            options.module_name = name;
        }
        if self.opt {
            options.opt_level = OptLevel::Basic;
        }

        let parsed = parsed.try_into_valid()?;
        let output = parsed.compile(&options);

        for warning in &output.warnings {
            source.print_warning(warning);
        }
        source.print_asm_errors(&output.errors);

        let module = match output.module {
            Ok(module) => module,
            Err(e) => {
                source.print_compile_error(&e);
                anyhow::bail!("Build failed");
            }
        };

        let bytes = match self.emit {
            Emit::Ll => module.to_string().into_bytes(),
            Emit::Clif => asm6502::codegen::emit(&module)?.clif.into_bytes(),
            Emit::Obj => asm6502::codegen::emit(&module)?.object,
        };
        std::fs::write(&out, bytes)
            .with_context(|| format!("Failed to write output file `{}`", out.display()))?;

        let block_count = module
            .functions
            .iter()
            .map(|func| func.blocks.len())
            .sum::<usize>();

        if !self.json && std::io::stdout().is_terminal() {
            eprintln!(
                "Module path:\t{}\n\
                Module name:\t{}\n\
                Data globals:\t{}\n\
                Basic blocks:\t{}\n\
                Warnings:\t{}\n\
                Errors:\t\t{}",
                out.display(),
                module.name,
                module.globals.len(),
                block_count,
                output.warnings.len(),
                output.errors.len(),
            );
        } else {
            let output = serde_json::to_string_pretty(&serde_json::json!({
                "module_path": out.display().to_string(),
                "module_name": module.name,
                "globals": module.globals.iter().map(|g| &g.name).collect::<Vec<_>>(),
                "block_count": block_count,
                "warnings": output.warnings.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "errors": output.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
            }))?;
            println!("{output}");
        }

        anyhow::ensure!(output.errors.is_empty(), "Build finished with errors");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Emit {
    Ll,
    Clif,
    Obj,
}

impl Emit {
    fn extension(self) -> &'static str {
        match self {
            Self::Ll => "ll",
            Self::Clif => "clif",
            Self::Obj => "o",
        }
    }
}

impl FromStr for Emit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "ll" => Self::Ll,
            "clif" => Self::Clif,
            "obj" => Self::Obj,
            _ => anyhow::bail!("unknown output format `{s}`"),
        })
    }
}

/// Prints the flat encoding of an .s file
#[derive(FromArgs)]
#[argh(subcommand, name = "encode")]
struct CmdEncode {
    /// path to the input file with assembly code
    #[argh(positional)]
    input: PathBuf,
    /// output the listing as JSON
    #[argh(switch)]
    json: bool,
}

impl CmdEncode {
    fn run(self) -> Result<()> {
        let code = read_source(&self.input)?;
        let source = Source::new(&self.input, &code);

        let parsed = Code::parse(&code);
        if !parsed.parser_errors().is_empty() {
            source.print_parser_errors(parsed.parser_errors());
            anyhow::bail!("Encoding failed");
        }

        let parsed = parsed.try_into_valid()?;
        let program = parsed.program();

        if self.json {
            let instructions = program
                .instructions
                .iter()
                .map(|i| {
                    serde_json::json!({
                        "line": i.stmt.line,
                        "address": i.address,
                        "opcode": i.opcode,
                        "size": i.size,
                    })
                })
                .collect::<Vec<_>>();
            let labels = program.labels.iter().collect::<BTreeMap<_, _>>();
            let variables = program.variables.iter().collect::<BTreeMap<_, _>>();

            let output = serde_json::to_string_pretty(&serde_json::json!({
                "instructions": instructions,
                "labels": labels,
                "variables": variables,
                "errors": program.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
            }))?;
            println!("{output}");
        } else {
            let mut stdout = std::io::stdout().lock();
            for i in &program.instructions {
                let text = code
                    .get(i.stmt.span.start..i.stmt.span.end)
                    .unwrap_or_default();
                writeln!(
                    stdout,
                    "{:>5}  {:04X}  {:02X}  {}  {}",
                    i.stmt.line, i.address, i.opcode, i.size, text
                )?;
            }
        }

        source.print_asm_errors(&program.errors);
        anyhow::ensure!(program.errors.is_empty(), "Encoding failed");
        Ok(())
    }
}

fn read_source(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read assembly code from `{}`", path.display()))
}

struct Source<'a> {
    path: &'a Path,
    code: &'a str,
    meta: SourceMeta,
}

impl<'a> Source<'a> {
    fn new(path: &'a Path, code: &'a str) -> Self {
        Self {
            path,
            code,
            meta: SourceMeta::new(code),
        }
    }

    fn print_parser_errors(&self, errors: &[ParserError]) {
        for error in errors {
            self.print(Severity::Error, "parser", error.span(), error);
        }
    }

    fn print_asm_errors(&self, errors: &[AsmError]) {
        for error in errors {
            self.print(Severity::Error, "asm", error.span(), error);
        }
    }

    fn print_warning(&self, warning: &Warning) {
        self.print(Severity::Warning, "compile", warning.span(), warning);
    }

    fn print_compile_error(&self, error: &CompileError) {
        match error.span() {
            Some(span) => self.print(Severity::Error, "compile", span, error),
            None => eprintln!(
                "{}{}\n",
                Severity::Error.style("compile"),
                style(error).bold()
            ),
        }
    }

    fn print(&self, severity: Severity, origin: &str, span: Span, error: &dyn std::fmt::Display) {
        match self.report(severity, origin, span, error) {
            Some(report) => eprintln!("{report}\n"),
            None => eprintln!("{}{}\n", severity.style(origin), style(error).bold()),
        }
    }

    fn report<'r>(
        &'r self,
        severity: Severity,
        origin: &'r str,
        span: Span,
        error: &'r dyn std::fmt::Display,
    ) -> Option<Report<'r>> {
        Some(Report {
            start: self.meta.byte_index_to_position(span.start).ok()?,
            end: self.meta.byte_index_to_position(span.end).ok()?,
            file_name: self.path,
            code: self.code,
            severity,
            origin,
            error,
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Severity {
    Error,
    Warning,
}

impl Severity {
    fn style(self, origin: &str) -> StyledObject<String> {
        match self {
            Self::Error => style(format!("error[{origin}]: ")).red(),
            Self::Warning => style(format!("warning[{origin}]: ")).yellow(),
        }
    }
}

struct Report<'a> {
    start: Position,
    end: Position,
    file_name: &'a Path,
    code: &'a str,
    severity: Severity,
    origin: &'a str,
    error: &'a dyn std::fmt::Display,
}

impl std::fmt::Display for Report<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let line_number = (self.start.line + 1).to_string();
        let offset_len = line_number.len();
        let offset = format!("{:offset_len$}", "");

        let arrow = style("-->").blue().bold();
        let block = style("|").blue().bold();
        let line_number = style(line_number).blue().bold();

        let line = self.code[self.start.line_start..self.start.line_end].trim_end();
        let word_start = self.start.character.min(line.len());
        let word_end = if self.end.line == self.start.line {
            self.end.character
        } else {
            line.len()
        };
        let word_end = word_end.clamp(word_start, line.len());

        let (line_start, rest) = line.split_at(word_start);
        let (underlined, line_end) = rest.split_at(word_end - word_start);

        let line_start_len = UnicodeWidthStr::width(line_start);
        let underlined_len = UnicodeWidthStr::width(underlined).max(1);
        let underline = format!("{:^>1$}", "", underlined_len);
        let underline = match self.severity {
            Severity::Error => style(underline).red(),
            Severity::Warning => style(underline).yellow(),
        };

        write!(
            f,
            "{}{}\n\
            {offset}{arrow} {}:{}:{}\n\
            {offset} {block}\n\
            {line_number} {block} {}{}{}\n\
            {offset} {block} {:line_start_len$}{}\n\
            {offset} {block}",
            self.severity.style(self.origin),
            style(self.error).bold(),
            self.file_name.display(),
            self.start.line + 1,
            self.start.character + 1,
            line_start,
            style(underlined).red(),
            line_end,
            "",
            underline,
        )
    }
}
