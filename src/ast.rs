//! AST node types for the Droe DSL.

use crate::types::Ty;

/// Index into the compilation's `SourceMap`.
pub type FileId = u16;

/// A position in a source file. Lines and columns are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pos {
    pub file: FileId,
    pub line: u32,
    pub column: u32,
}

/// Source span for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: Pos,
    pub end: Pos,
}

impl Span {
    pub fn new(start: Pos, end: Pos) -> Self {
        Self { start, end }
    }

    pub fn point(pos: Pos) -> Self {
        Self { start: pos, end: pos }
    }

    pub fn merge(self, other: Span) -> Span {
        let start = if (other.start.line, other.start.column) < (self.start.line, self.start.column)
        {
            other.start
        } else {
            self.start
        };
        let end = if (other.end.line, other.end.column) > (self.end.line, self.end.column) {
            other.end
        } else {
            self.end
        };
        Span { start, end }
    }
}

/// A complete parsed source file, before include resolution.
#[derive(Debug, Clone)]
pub struct Program {
    pub metadata: Vec<Metadata>,
    pub includes: Vec<Include>,
    pub items: Vec<Stmt>,
}

/// `@target web` or `@name "inventory"` at the top of a file. Recognized
/// keys are `target`, `name`, `description`, `package`; anything else is
/// preserved verbatim.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub key: String,
    pub value: String,
    pub span: Span,
}

/// `@include Billing from "billing.droe"`
#[derive(Debug, Clone)]
pub struct Include {
    pub module: String,
    pub path: String,
    pub span: Span,
}

// ── Expressions ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    /// `42`
    IntLit(i32),
    /// `1234.56`, stored scaled by 100 (`123456`).
    DecimalLit(i64),
    /// `"hello"` with no interpolation parts.
    TextLit(String),
    /// `true` / `false`
    FlagLit(bool),
    /// `"Hello [name], you are [age]"`
    Interp(Vec<InterpPart>),
    /// `[1, 2, 3]`
    ListLit(Vec<Expr>),
    /// Variable reference.
    Ident(String),
    /// `user.age`
    Property {
        object: Box<Expr>,
        field: String,
    },
    /// `a plus b`, `score is greater than 90`, ...
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// `-x` (negative literal or negated expression), `not flag`
    Unary {
        op: UnOp,
        operand: Box<Expr>,
    },
    /// `format price as "#,##0.00"`
    Format {
        value: Box<Expr>,
        pattern: String,
    },
    /// `add with 10, 5` or `math.square with 4`: only valid in call
    /// positions (`set ... from`, `run`).
    ActionCall {
        module: Option<String>,
        action: String,
        args: Vec<Expr>,
    },
    /// `x is empty` / `x is not empty`
    IsEmpty {
        operand: Box<Expr>,
        negated: bool,
    },
}

/// One chunk of an interpolated string.
#[derive(Debug, Clone, PartialEq)]
pub enum InterpPart {
    Lit(String),
    Expr(Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

// ── Statements ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    /// `display <expr>`
    Display(Expr),
    /// `set x [which is int] to <expr>`: declaration on first sight,
    /// reassignment afterwards (the checker decides which).
    Set {
        name: String,
        declared: Option<Ty>,
        value: Expr,
    },
    /// `set x [which is int] from <action> with <args>`
    SetFrom {
        name: String,
        declared: Option<Ty>,
        call: Expr,
    },
    /// `when c then ... otherwise when c2 then ... otherwise ... end when`,
    /// or the single-line `when c then <stmt>`.
    When {
        arms: Vec<WhenArm>,
        otherwise: Option<Vec<Stmt>>,
    },
    /// `while c ... end while`
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    /// `for each x in xs ... end for`
    ForEach {
        var: String,
        iterable: Expr,
        body: Vec<Stmt>,
    },
    /// `action name with a which is int gives int ... end action`;
    /// a task is an action whose signature lacks `gives`.
    Action(ActionDef),
    /// `give <expr>` (bare `give` exits a task early)
    Give(Option<Expr>),
    /// `run <action> [with args]`
    Run(Expr),
    /// `module name ... end module`
    Module(ModuleDef),
    /// `data Name ... end data`
    Data(DataDef),
    /// `db find User where name equals "ada" into u`
    Database(DbStmt),
    /// `serve get /users/:id ... end serve`
    Serve(ServeDef),
    /// `respond 200 with body`: valid inside serve handlers.
    Respond {
        status: Expr,
        body: Option<Expr>,
    },
    /// `call <url> method POST with payload using headers ... end headers into resp`
    HttpCall(HttpCallStmt),
    /// `fragment`/`screen`/`layout` declarations.
    Ui(UiElement),
}

#[derive(Debug, Clone)]
pub struct WhenArm {
    pub cond: Expr,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct ActionDef {
    pub name: String,
    pub params: Vec<Param>,
    pub gives: Option<Ty>,
    pub body: Vec<Stmt>,
    pub is_task: bool,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub ty: Ty,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct ModuleDef {
    pub name: String,
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct DataDef {
    pub name: String,
    pub fields: Vec<DataField>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct DataField {
    pub name: String,
    pub ty: Ty,
    pub annotations: Vec<FieldAnnotation>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldAnnotation {
    Key,
    Auto,
    Required,
    Optional,
    Unique,
    Default(Expr),
}

#[derive(Debug, Clone)]
pub struct DbStmt {
    pub op: DbOp,
    pub entity: String,
    /// `with <field> is <expr>, ...` on create.
    pub with: Vec<(String, Expr)>,
    /// `where <cond>`: comparisons on fields joined by `and`.
    pub where_cond: Option<Expr>,
    /// `set <field> is <expr>, ...` on update.
    pub set: Vec<(String, Expr)>,
    /// `into <name>` binds the host's result.
    pub into: Option<String>,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbOp {
    Create,
    Find,
    FindAll,
    Update,
    Delete,
}

impl DbOp {
    /// Bytecode op-code for `DatabaseOp`.
    pub fn code(self) -> u8 {
        match self {
            DbOp::Find => 0,
            DbOp::FindAll => 1,
            DbOp::Create => 2,
            DbOp::Update => 3,
            DbOp::Delete => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(DbOp::Find),
            1 => Some(DbOp::FindAll),
            2 => Some(DbOp::Create),
            3 => Some(DbOp::Update),
            4 => Some(DbOp::Delete),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DbOp::Find => "find",
            DbOp::FindAll => "find_all",
            DbOp::Create => "create",
            DbOp::Update => "update",
            DbOp::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServeDef {
    pub method: HttpMethod,
    /// Path template as written, e.g. `/users/:id`.
    pub path: String,
    /// `:param` segment names in template order.
    pub path_params: Vec<String>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }

    pub fn parse(word: &str) -> Option<Self> {
        match word.to_ascii_lowercase().as_str() {
            "get" => Some(HttpMethod::Get),
            "post" => Some(HttpMethod::Post),
            "put" => Some(HttpMethod::Put),
            "delete" => Some(HttpMethod::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpCallStmt {
    pub url: Expr,
    pub method: HttpMethod,
    pub body: Option<Expr>,
    pub headers: Vec<(String, Expr)>,
    pub into: String,
    pub span: Span,
}

// ── UI ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum UiElement {
    Fragment(FragmentDef),
    Screen(ScreenDef),
}

/// `fragment card ... end fragment`: a reusable template with named slots.
#[derive(Debug, Clone)]
pub struct FragmentDef {
    pub name: String,
    pub body: Vec<UiNode>,
    pub span: Span,
}

/// `screen home ... end screen`: a UI root that instantiates fragments
/// and fills their slots by name.
#[derive(Debug, Clone)]
pub struct ScreenDef {
    pub name: String,
    pub body: Vec<UiNode>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum UiNode {
    Title { text: String, attrs: Vec<UiAttr>, span: Span },
    Text { text: String, attrs: Vec<UiAttr>, span: Span },
    Input { input_type: String, attrs: Vec<UiAttr>, span: Span },
    Button { label: String, attrs: Vec<UiAttr>, span: Span },
    /// `slot "content"` inside a fragment: a named content hole.
    Slot { name: String, span: Span },
    /// `fragment card ... end fragment` inside a screen: instantiates the
    /// named fragment, filling slots by name.
    UseFragment { fragment: String, fills: Vec<SlotFill>, span: Span },
    /// `layout ... end layout` grouping.
    Layout { name: Option<String>, children: Vec<UiNode>, span: Span },
}

#[derive(Debug, Clone)]
pub struct SlotFill {
    pub slot: String,
    pub content: Vec<UiNode>,
    pub span: Span,
}

/// Free-form component attribute (`id`, `class`, `bind`, `action`, ...).
#[derive(Debug, Clone)]
pub struct UiAttr {
    pub name: String,
    pub value: String,
}

impl UiNode {
    pub fn span(&self) -> Span {
        match self {
            UiNode::Title { span, .. }
            | UiNode::Text { span, .. }
            | UiNode::Input { span, .. }
            | UiNode::Button { span, .. }
            | UiNode::Slot { span, .. }
            | UiNode::UseFragment { span, .. }
            | UiNode::Layout { span, .. } => *span,
        }
    }
}
