use chumsky::prelude::*;

pub type Span = SimpleSpan<usize>;

/// Parses the whole source text.
///
/// The syntax is line oriented, so every line is parsed on its own and a
/// syntax error only drops the offending line. Spans are absolute byte
/// offsets into `text`.
pub fn parse(text: &str) -> (Ast<'_>, Vec<ParserError>) {
    let mut items = Vec::new();
    let mut errors = Vec::new();

    let mut offset = 0;
    for (i, raw_line) in text.split_inclusive('\n').enumerate() {
        let at = LineCtx { offset, line: i + 1 };
        offset += raw_line.len();

        let line = raw_line.trim_end_matches(['\r', '\n']);
        match line_parser(at).parse(line).into_result() {
            Ok((label, stmt)) => {
                items.extend(label.map(Stmt::Label));
                items.extend(stmt);
            }
            Err(line_errors) => errors.extend(line_errors.into_iter().map(|e| ParserError {
                span: at.span(*e.span()),
                line: at.line,
                message: e.to_string(),
            })),
        }
    }

    let ast = Ast {
        span: Span::from(0..text.len()),
        items,
    };
    (ast, errors)
}

#[derive(Debug, Clone)]
pub struct Ast<'a> {
    pub span: Span,
    pub items: Vec<Stmt<'a>>,
}

impl<'a> Ast<'a> {
    /// Visits every statement in source order, then signals the end of the
    /// traversal.
    pub fn walk<V: Visitor<'a>>(&'a self, visitor: &mut V) {
        for stmt in &self.items {
            visitor.visit(stmt);
        }
        visitor.visit_end(self);
    }

    /// Position of a statement borrowed from `items`.
    pub fn index_of(&self, stmt: &Stmt<'_>) -> Option<usize> {
        let size = std::mem::size_of::<Stmt<'_>>();
        let base = self.items.as_ptr() as usize;
        let offset = (stmt as *const Stmt<'_> as usize).checked_sub(base)?;
        let index = offset / size;
        (offset % size == 0 && index < self.items.len()).then_some(index)
    }
}

pub trait Visitor<'a> {
    fn visit(&mut self, stmt: &'a Stmt<'a>);

    fn visit_end(&mut self, ast: &'a Ast<'a>);
}

#[derive(Debug, Clone)]
pub enum Stmt<'a> {
    Label(Label<'a>),
    Assign(Assign<'a>),
    Org(Org),
    Data(Data<'a>),
    Instr(Instr<'a>),
}

impl Stmt<'_> {
    pub fn span(&self) -> Span {
        match self {
            Self::Label(Label { span, .. })
            | Self::Assign(Assign { span, .. })
            | Self::Org(Org { span, .. })
            | Self::Data(Data { span, .. })
            | Self::Instr(Instr { span, .. }) => *span,
        }
    }

    pub fn line(&self) -> usize {
        match self {
            Self::Label(Label { line, .. })
            | Self::Assign(Assign { line, .. })
            | Self::Org(Org { line, .. })
            | Self::Data(Data { line, .. })
            | Self::Instr(Instr { line, .. }) => *line,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Label<'a> {
    pub span: Span,
    pub line: usize,
    pub name: &'a str,
}

/// `NAME = value`
#[derive(Debug, Clone)]
pub struct Assign<'a> {
    pub span: Span,
    pub line: usize,
    pub name: &'a str,
    pub value: u32,
}

/// Moves the location counter.
#[derive(Debug, Clone)]
pub struct Org {
    pub span: Span,
    pub line: usize,
    pub address: u32,
}

#[derive(Debug, Clone)]
pub struct Data<'a> {
    pub span: Span,
    pub line: usize,
    pub width: DataWidth,
    pub items: Vec<DataItem<'a>>,
}

impl Data<'_> {
    /// Number of bytes the declaration occupies.
    pub fn size(&self) -> u32 {
        match self.width {
            DataWidth::Word => 2 * self.items.len() as u32,
            DataWidth::Byte => self
                .items
                .iter()
                .map(|item| match item.value {
                    DataValue::Str(s) => s.len() as u32,
                    DataValue::Int(_) | DataValue::Label(_) => 1,
                })
                .sum(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataWidth {
    /// `dc.b`
    Byte,
    /// `dc.w`
    Word,
}

#[derive(Debug, Clone)]
pub struct DataItem<'a> {
    pub span: Span,
    pub value: DataValue<'a>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataValue<'a> {
    Int(u32),
    Str(&'a str),
    Label(&'a str),
}

#[derive(Debug, Clone)]
pub struct Instr<'a> {
    pub span: Span,
    pub line: usize,
    pub mnemonic: &'a str,
    pub mnemonic_span: Span,
    pub operand: Operand<'a>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value<'a> {
    Int(u32),
    Name(&'a str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register<'a> {
    pub span: Span,
    pub name: &'a str,
}

/// Operand shape of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand<'a> {
    /// `INX`
    Implied,
    /// `LDA #$10`
    Immediate(Value<'a>),
    /// `LDA $10`
    Direct(u32),
    /// `JMP loop`
    DirectWithLabel(&'a str),
    /// `LDA $1000, X`
    DirectIndexed { address: u32, register: Register<'a> },
    /// `LDA table, X`
    DirectWithLabelIndexed {
        label: &'a str,
        register: Register<'a>,
    },
    /// `LDA ($10, X)`
    IndirectX {
        address: Value<'a>,
        register: Register<'a>,
    },
    /// `LDA ($10), Y`
    IndirectY {
        address: Value<'a>,
        register: Register<'a>,
    },
    /// `JMP ($fffc)`
    Indirect(Value<'a>),
}

impl Operand<'_> {
    pub fn kind(&self) -> InstrKind {
        match self {
            Self::Implied => InstrKind::Implied,
            Self::Immediate(_) => InstrKind::Immediate,
            Self::Direct(_) => InstrKind::Direct,
            Self::DirectWithLabel(_) => InstrKind::DirectWithLabel,
            Self::DirectIndexed { .. } => InstrKind::DirectIndexed,
            Self::DirectWithLabelIndexed { .. } => InstrKind::DirectWithLabelIndexed,
            Self::IndirectX { .. } => InstrKind::IndirectX,
            Self::IndirectY { .. } => InstrKind::IndirectY,
            Self::Indirect(_) => InstrKind::Indirect,
        }
    }
}

/// Operand shape without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstrKind {
    Implied,
    Immediate,
    Direct,
    DirectWithLabel,
    DirectIndexed,
    DirectWithLabelIndexed,
    IndirectX,
    IndirectY,
    Indirect,
}

impl std::fmt::Display for InstrKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Implied => "implied",
            Self::Immediate => "immediate",
            Self::Direct => "direct",
            Self::DirectWithLabel => "direct with label",
            Self::DirectIndexed => "direct indexed",
            Self::DirectWithLabelIndexed => "direct with label indexed",
            Self::IndirectX => "indirect X",
            Self::IndirectY => "indirect Y",
            Self::Indirect => "indirect",
        })
    }
}

#[derive(thiserror::Error, Debug, Clone)]
#[error("line {line}: {message}")]
pub struct ParserError {
    pub span: Span,
    pub line: usize,
    pub message: String,
}

impl ParserError {
    pub fn span(&self) -> Span {
        self.span
    }
}

#[derive(Debug, Clone, Copy)]
struct LineCtx {
    offset: usize,
    line: usize,
}

impl LineCtx {
    fn span(&self, span: Span) -> Span {
        Span::from(self.offset + span.start..self.offset + span.end)
    }
}

type ParserExtra<'a> = extra::Err<Rich<'a, char>>;

fn line_parser<'a>(
    at: LineCtx,
) -> impl Parser<'a, &'a str, (Option<Label<'a>>, Option<Stmt<'a>>), ParserExtra<'a>> {
    let label = text::ident()
        .then_ignore(just(':'))
        .map_with(move |name, e| Label {
            span: at.span(e.span()),
            line: at.line,
            name,
        });

    let comment = just(';').then(any().repeated()).ignored();

    text::inline_whitespace()
        .ignore_then(label.then_ignore(text::inline_whitespace()).or_not())
        .then(stmt(at).or_not())
        .then_ignore(text::inline_whitespace())
        .then_ignore(comment.or_not())
        .then_ignore(end())
}

fn stmt<'a>(at: LineCtx) -> impl Parser<'a, &'a str, Stmt<'a>, ParserExtra<'a>> + Clone {
    let assign = text::ident()
        .then_ignore(just('=').padded_by(text::inline_whitespace()))
        .then(number())
        .map_with(move |(name, value), e| {
            Stmt::Assign(Assign {
                span: at.span(e.span()),
                line: at.line,
                name,
                value,
            })
        });

    let org = keyword(&["org", ".org"])
        .ignore_then(text::inline_whitespace())
        .ignore_then(number())
        .map_with(move |address, e| {
            Stmt::Org(Org {
                span: at.span(e.span()),
                line: at.line,
                address,
            })
        });

    let width = choice((
        keyword(&["dc.b", ".byte", "db"]).to(DataWidth::Byte),
        keyword(&["dc.w", ".word", "dw"]).to(DataWidth::Word),
    ));

    let data = width
        .then_ignore(text::inline_whitespace())
        .then(
            data_item(at)
                .separated_by(just(',').padded_by(text::inline_whitespace()))
                .at_least(1)
                .collect::<Vec<_>>(),
        )
        .map_with(move |(width, items), e| {
            Stmt::Data(Data {
                span: at.span(e.span()),
                line: at.line,
                width,
                items,
            })
        });

    let instr = text::ident()
        .map_with(move |mnemonic, e| (mnemonic, at.span(e.span())))
        .then(
            text::inline_whitespace()
                .ignore_then(operand(at))
                .or_not(),
        )
        .map_with(move |((mnemonic, mnemonic_span), operand), e| {
            Stmt::Instr(Instr {
                span: at.span(e.span()),
                line: at.line,
                mnemonic,
                mnemonic_span,
                operand: operand.unwrap_or(Operand::Implied),
            })
        });

    choice((assign, org, data, instr))
}

fn operand<'a>(at: LineCtx) -> impl Parser<'a, &'a str, Operand<'a>, ParserExtra<'a>> + Clone {
    let comma = just(',').padded_by(text::inline_whitespace());
    let open = just('(').then(text::inline_whitespace());
    let close = text::inline_whitespace().then(just(')'));

    let register = text::ident().map_with(move |name, e| Register {
        span: at.span(e.span()),
        name,
    });

    let immediate = just('#')
        .ignore_then(value())
        .map(Operand::Immediate);

    let indirect_x = open
        .clone()
        .ignore_then(value())
        .then_ignore(comma.clone())
        .then(register.clone())
        .then_ignore(close.clone())
        .map(|(address, register)| Operand::IndirectX { address, register });

    let indirect_y = open
        .clone()
        .ignore_then(value())
        .then_ignore(close.clone())
        .then_ignore(comma.clone())
        .then(register.clone())
        .map(|(address, register)| Operand::IndirectY { address, register });

    let indirect = open
        .ignore_then(value())
        .then_ignore(close)
        .map(Operand::Indirect);

    let indexed = value()
        .then_ignore(comma)
        .then(register)
        .map(|(value, register)| match value {
            Value::Int(address) => Operand::DirectIndexed { address, register },
            Value::Name(label) => Operand::DirectWithLabelIndexed { label, register },
        });

    let direct = value().map(|value| match value {
        Value::Int(address) => Operand::Direct(address),
        Value::Name(label) => Operand::DirectWithLabel(label),
    });

    choice((immediate, indirect_x, indirect_y, indirect, indexed, direct))
}

fn data_item<'a>(at: LineCtx) -> impl Parser<'a, &'a str, DataItem<'a>, ParserExtra<'a>> + Clone {
    let string = none_of("\"")
        .repeated()
        .to_slice()
        .delimited_by(just('"'), just('"'));

    choice((
        string.map(DataValue::Str),
        number().map(DataValue::Int),
        text::ident().map(DataValue::Label),
    ))
    .map_with(move |value, e| DataItem {
        span: at.span(e.span()),
        value,
    })
}

fn value<'a>() -> impl Parser<'a, &'a str, Value<'a>, ParserExtra<'a>> + Clone {
    choice((number().map(Value::Int), text::ident().map(Value::Name)))
}

fn number<'a>() -> impl Parser<'a, &'a str, u32, ParserExtra<'a>> + Clone {
    fn digits<'a>(radix: u32) -> impl Parser<'a, &'a str, u32, ParserExtra<'a>> + Clone {
        text::digits(radix)
            .to_slice()
            .try_map(move |s: &str, span| {
                u32::from_str_radix(s, radix).map_err(|e| Rich::custom(span, e))
            })
    }

    choice((
        just('$').ignore_then(digits(16)),
        just("0x").ignore_then(digits(16)),
        just('%').ignore_then(digits(2)),
        digits(10),
    ))
}

/// Case-insensitive directive name.
fn keyword<'a>(
    names: &'static [&'static str],
) -> impl Parser<'a, &'a str, (), ParserExtra<'a>> + Clone {
    any()
        .filter(|c: &char| c.is_ascii_alphanumeric() || *c == '_' || *c == '.')
        .repeated()
        .at_least(1)
        .to_slice()
        .filter(move |word: &&str| names.iter().any(|name| name.eq_ignore_ascii_case(word)))
        .ignored()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(text: &str) -> Ast<'_> {
        let (ast, errors) = parse(text);
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
        ast
    }

    fn single_instr(text: &str) -> Operand<'_> {
        let ast = parse_ok(text);
        match ast.items.as_slice() {
            [Stmt::Instr(instr)] => instr.operand,
            other => panic!("expected a single instruction, got {other:?}"),
        }
    }

    #[test]
    fn empty_asm() {
        let ast = parse_ok("");
        assert!(ast.items.is_empty());

        let ast = parse_ok("\n   \n ; only a comment\n");
        assert!(ast.items.is_empty());
    }

    #[test]
    fn operand_shapes() {
        assert_eq!(single_instr("INX"), Operand::Implied);
        assert_eq!(single_instr("  lda #$10"), Operand::Immediate(Value::Int(0x10)));
        assert_eq!(
            single_instr("LDA #VALUE"),
            Operand::Immediate(Value::Name("VALUE"))
        );
        assert_eq!(single_instr("lda $1234"), Operand::Direct(0x1234));
        assert_eq!(single_instr("jmp loop"), Operand::DirectWithLabel("loop"));
        assert_eq!(single_instr("lda %101"), Operand::Direct(5));
        assert_eq!(single_instr("lda 0x20"), Operand::Direct(0x20));
        assert_eq!(single_instr("lda 20"), Operand::Direct(20));

        assert!(matches!(
            single_instr("lda $1000, x"),
            Operand::DirectIndexed {
                address: 0x1000,
                register: Register { name: "x", .. }
            }
        ));
        assert!(matches!(
            single_instr("lda table,Y"),
            Operand::DirectWithLabelIndexed {
                label: "table",
                register: Register { name: "Y", .. }
            }
        ));
        assert!(matches!(
            single_instr("lda ($10, X)"),
            Operand::IndirectX {
                address: Value::Int(0x10),
                register: Register { name: "X", .. }
            }
        ));
        assert!(matches!(
            single_instr("sta ( ptr ),Y ; store"),
            Operand::IndirectY {
                address: Value::Name("ptr"),
                register: Register { name: "Y", .. }
            }
        ));
        assert_eq!(
            single_instr("JMP ($FFFC)"),
            Operand::Indirect(Value::Int(0xfffc))
        );
    }

    #[test]
    fn labels_and_directives() {
        let ast = parse_ok(
            r#"
            SCREEN = $2000
                org $c000
            msg:    dc.b "hi", 10, 0
            start:  lda #1 ; load
            vectors:
                dc.w start, $1234
            "#,
        );

        let items = &ast.items;
        assert_eq!(items.len(), 8);
        assert!(matches!(
            items[0],
            Stmt::Assign(Assign {
                name: "SCREEN",
                value: 0x2000,
                line: 2,
                ..
            })
        ));
        assert!(matches!(items[1], Stmt::Org(Org { address: 0xc000, .. })));
        assert!(matches!(items[2], Stmt::Label(Label { name: "msg", .. })));

        let Stmt::Data(data) = &items[3] else {
            panic!("expected data, got {:?}", items[3]);
        };
        assert_eq!(data.width, DataWidth::Byte);
        assert_eq!(data.line, 4);
        assert_eq!(data.size(), 4);
        assert_eq!(
            data.items.iter().map(|item| item.value).collect::<Vec<_>>(),
            [DataValue::Str("hi"), DataValue::Int(10), DataValue::Int(0)]
        );

        assert!(matches!(items[4], Stmt::Label(Label { name: "start", .. })));
        assert!(matches!(
            &items[5],
            Stmt::Instr(Instr {
                mnemonic: "lda",
                line: 5,
                ..
            })
        ));
        assert!(matches!(items[6], Stmt::Label(Label { name: "vectors", .. })));
        assert!(matches!(
            items[7],
            Stmt::Data(Data {
                width: DataWidth::Word,
                ..
            })
        ));
    }

    #[test]
    fn word_data() {
        let ast = parse_ok(".word reset, $10\n");
        let [Stmt::Data(data)] = ast.items.as_slice() else {
            panic!("expected data, got {:?}", ast.items);
        };
        assert_eq!(data.width, DataWidth::Word);
        assert_eq!(data.size(), 4);
        assert_eq!(data.items[0].value, DataValue::Label("reset"));
        assert_eq!(data.items[1].value, DataValue::Int(0x10));
    }

    #[test]
    fn spans_are_absolute() {
        let text = "nop\n  lda #1\n";
        let ast = parse_ok(text);
        let Stmt::Instr(instr) = &ast.items[1] else {
            panic!("expected instruction");
        };
        assert_eq!(&text[instr.mnemonic_span.start..instr.mnemonic_span.end], "lda");
        assert_eq!(&text[instr.span.start..instr.span.end], "lda #1");
    }

    #[test]
    fn errors_do_not_stop_parsing() {
        let (ast, errors) = parse("nop\nlda #\ninx\n");
        assert!(!errors.is_empty());
        assert!(errors.iter().all(|e| e.line == 2));
        assert_eq!(ast.items.len(), 2);
    }
}
