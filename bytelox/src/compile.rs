use std::iter::Peekable;

use crate::{
    scan, Chunk, Heap, Kind, Obj, ObjFun, ObjRef, Opcode, ParseError, Position, Scanner, Token,
    Trace, Value, MAX_LOCAL_VARIABLES, MAX_PARAMS, MAX_UPVALUES,
};

/// Compile the given source into the bytecode of a top-level script
/// function.
///
/// Every error is reported to stderr as it is found; when any was seen the
/// whole compile returns `None`. Allocations made while compiling (interned
/// identifiers, string literals, finished functions) trace the in-progress
/// function chain plus the caller's `ambient` roots, so the collector may
/// run at any point during code generation.
pub fn compile(src: &str, heap: &mut Heap, ambient: &dyn Trace) -> Option<ObjRef> {
    let mut parser = Parser::new(src, heap, ambient);
    while parser.peek().is_some() {
        if let Err(err) = parser.declaration() {
            eprintln!("{}", err);
            parser.had_error = true;
            parser.synchronize();
        }
    }
    parser.finish()
}

/// What kind of function a compile unit is producing. Governs `return`
/// handling and the name of the reserved slot 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunKind {
    Script,
    Function,
    Method,
    Initializer,
}

/// A local variable slot. While `depth` is -1 the variable is declared but
/// not yet initialized, and reading it is an error.
#[derive(Debug)]
struct Local {
    name: String,
    depth: i32,
    is_captured: bool,
}

/// Descriptor emitted for each upvalue a closure captures: either a local
/// slot of the immediately enclosing function, or an index into the
/// enclosing closure's own upvalues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueDescriptor {
    index: u8,
    is_local: bool,
}

/// Per-function compilation state. Units nest: the enclosing unit is the
/// previous element of the parser's stack.
///
/// The local table mirrors the VM's frame layout: the local at index `k`
/// here occupies frame slot `k` at runtime.
#[derive(Debug)]
struct CompileUnit {
    fun: ObjFun,
    kind: FunKind,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDescriptor>,
    scope_depth: i32,
}

impl CompileUnit {
    fn new(name: Option<ObjRef>, kind: FunKind) -> Self {
        // Slot 0 belongs to the callee: it is `this` inside methods and
        // initializers, and unnameable everywhere else.
        let slot_zero = Local {
            name: match kind {
                FunKind::Method | FunKind::Initializer => "this".to_string(),
                _ => String::new(),
            },
            depth: 0,
            is_captured: false,
        };
        Self {
            fun: ObjFun::new(name),
            kind,
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

/// Per-class compilation state, tracking whether `super` is available.
#[derive(Debug)]
struct ClassUnit {
    has_superclass: bool,
}

/// GC roots visible while compiling: every in-progress function's name and
/// constants, chained to whatever the caller already had rooted.
struct CompilerRoots<'a> {
    units: &'a [CompileUnit],
    ambient: &'a dyn Trace,
}

impl Trace for CompilerRoots<'_> {
    fn trace(&self, heap: &mut Heap) {
        for unit in self.units {
            if let Some(name) = unit.fun.name {
                heap.mark_object(name);
            }
            for &constant in unit.fun.chunk.constants() {
                heap.mark_value(constant);
            }
        }
        self.ambient.trace(heap);
    }
}

/// Scans for tokens and emits corresponding bytecode, one pass, no AST.
pub struct Parser<'src, 'ctx> {
    tokens: Peekable<scan::Iter<'src>>,
    heap: &'ctx mut Heap,
    ambient: &'ctx dyn Trace,
    units: Vec<CompileUnit>,
    classes: Vec<ClassUnit>,
    last_pos: Position,
    last_lexeme: String,
    had_error: bool,
}

impl std::fmt::Debug for Parser<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parser")
            .field("units", &self.units.len())
            .field("had_error", &self.had_error)
            .finish_non_exhaustive()
    }
}

impl<'src, 'ctx> Parser<'src, 'ctx> {
    /// Create a parser compiling a fresh top-level script.
    pub fn new(src: &'src str, heap: &'ctx mut Heap, ambient: &'ctx dyn Trace) -> Self {
        Self {
            tokens: Scanner::new(src).into_iter().peekable(),
            heap,
            ambient,
            units: vec![CompileUnit::new(None, FunKind::Script)],
            classes: Vec::new(),
            last_pos: Position::default(),
            last_lexeme: String::new(),
            had_error: false,
        }
    }

    fn finish(mut self) -> Option<ObjRef> {
        let (script, _) = self.end_unit();
        if self.had_error {
            None
        } else {
            Some(script)
        }
    }

    // ----- declarations and statements -----

    fn declaration(&mut self) -> Result<(), ParseError> {
        if self.advance_when(Kind::Class).is_some() {
            return self.class_declaration();
        }
        if self.advance_when(Kind::Fun).is_some() {
            return self.fun_declaration();
        }
        if self.advance_when(Kind::Var).is_some() {
            return self.var_declaration();
        }
        self.statement()
    }

    fn class_declaration(&mut self) -> Result<(), ParseError> {
        let name = self.consume(Kind::Ident, "Expect class name.")?;
        let name_idx = self.identifier_constant(&name)?;
        self.declare_variable(&name)?;
        self.emit_op_byte(Opcode::Class, name_idx);
        if self.unit().scope_depth > 0 {
            self.mark_initialized();
        } else {
            self.emit_op_byte(Opcode::DefineGlobal, name_idx);
        }

        self.classes.push(ClassUnit {
            has_superclass: false,
        });
        let body = self.class_body(&name);
        let class = self.classes.pop().expect("class stack was pushed above");
        if class.has_superclass {
            self.end_scope();
        }
        body
    }

    fn class_body(&mut self, name: &Token) -> Result<(), ParseError> {
        if self.advance_when(Kind::Less).is_some() {
            let superclass = self.consume(Kind::Ident, "Expect superclass name.")?;
            if superclass.lexeme == name.lexeme {
                return Err(ParseError::at(
                    superclass.pos,
                    &superclass.lexeme,
                    "A class can't inherit from itself.",
                ));
            }
            self.named_variable(&superclass.lexeme, false)?;

            // The superclass lives in a scope of its own under the name
            // `super`, where every method closure can capture it.
            self.begin_scope();
            self.add_local("super")?;
            self.mark_initialized();
            self.classes
                .last_mut()
                .expect("class stack was pushed by the caller")
                .has_superclass = true;

            self.named_variable(&name.lexeme, false)?;
            self.emit(Opcode::Inherit);
        }

        self.named_variable(&name.lexeme, false)?;
        self.consume(Kind::LBrace, "Expect '{' before class body.")?;
        while self.peek().is_some() && !self.check(Kind::RBrace) {
            self.method()?;
        }
        self.consume(Kind::RBrace, "Expect '}' after class body.")?;
        self.emit(Opcode::Pop);
        Ok(())
    }

    fn method(&mut self) -> Result<(), ParseError> {
        let name = self.consume(Kind::Ident, "Expect method name.")?;
        let name_idx = self.identifier_constant(&name)?;
        let kind = if name.lexeme == "init" {
            FunKind::Initializer
        } else {
            FunKind::Method
        };
        self.function(kind, &name)?;
        self.emit_op_byte(Opcode::Method, name_idx);
        Ok(())
    }

    fn fun_declaration(&mut self) -> Result<(), ParseError> {
        let (name, global) = self.parse_variable("Expect function name.")?;
        // Initialized before the body compiles so the function can recurse.
        self.mark_initialized();
        self.function(FunKind::Function, &name)?;
        self.define_variable(global);
        Ok(())
    }

    fn function(&mut self, kind: FunKind, name: &Token) -> Result<(), ParseError> {
        let name_ref = self.intern(&name.lexeme);
        self.units.push(CompileUnit::new(Some(name_ref), kind));
        match self.function_inner() {
            Ok(()) => {}
            Err(err) => {
                // Abandon the half-built unit so recovery continues emitting
                // into the enclosing function.
                self.units.pop();
                return Err(err);
            }
        }
        let (fun, upvalues) = self.end_unit();
        let fun_idx = self.make_constant(Value::Obj(fun))?;
        self.emit_op_byte(Opcode::Closure, fun_idx);
        for upvalue in upvalues {
            self.emit_byte(u8::from(upvalue.is_local));
            self.emit_byte(upvalue.index);
        }
        Ok(())
    }

    fn function_inner(&mut self) -> Result<(), ParseError> {
        self.begin_scope();
        self.consume(Kind::LParen, "Expect '(' after function name.")?;
        if !self.check(Kind::RParen) {
            loop {
                if usize::from(self.unit().fun.arity) >= MAX_PARAMS {
                    return Err(self.error("Can't have more than 255 parameters."));
                }
                self.unit().fun.arity += 1;
                let (_, param) = self.parse_variable("Expect parameter name.")?;
                self.define_variable(param);
                if self.advance_when(Kind::Comma).is_none() {
                    break;
                }
            }
        }
        self.consume(Kind::RParen, "Expect ')' after parameters.")?;
        self.consume(Kind::LBrace, "Expect '{' before function body.")?;
        self.block()
    }

    fn var_declaration(&mut self) -> Result<(), ParseError> {
        let (_, global) = self.parse_variable("Expect variable name.")?;
        if self.advance_when(Kind::Equal).is_some() {
            self.expression()?;
        } else {
            self.emit(Opcode::Nil);
        }
        self.consume(Kind::Semicolon, "Expect ';' after variable declaration.")?;
        self.define_variable(global);
        Ok(())
    }

    fn statement(&mut self) -> Result<(), ParseError> {
        if let Some(tok) = self.advance_when(Kind::Print) {
            return self.print_statement(&tok);
        }
        if self.advance_when(Kind::If).is_some() {
            return self.if_statement();
        }
        if let Some(tok) = self.advance_when(Kind::Return) {
            return self.return_statement(&tok);
        }
        if self.advance_when(Kind::While).is_some() {
            return self.while_statement();
        }
        if self.advance_when(Kind::For).is_some() {
            return self.for_statement();
        }
        if self.advance_when(Kind::LBrace).is_some() {
            self.begin_scope();
            let body = self.block();
            self.end_scope();
            return body;
        }
        self.expression_statement()
    }

    fn block(&mut self) -> Result<(), ParseError> {
        while self.peek().is_some() && !self.check(Kind::RBrace) {
            self.declaration()?;
        }
        self.consume(Kind::RBrace, "Expect '}' after block.")?;
        Ok(())
    }

    fn print_statement(&mut self, tok: &Token) -> Result<(), ParseError> {
        self.expression()?;
        self.consume(Kind::Semicolon, "Expect ';' after value.")?;
        self.chunk().write_op(Opcode::Print, tok.pos);
        Ok(())
    }

    fn expression_statement(&mut self) -> Result<(), ParseError> {
        self.expression()?;
        self.consume(Kind::Semicolon, "Expect ';' after expression.")?;
        self.emit(Opcode::Pop);
        Ok(())
    }

    fn if_statement(&mut self) -> Result<(), ParseError> {
        self.consume(Kind::LParen, "Expect '(' after 'if'.")?;
        self.expression()?;
        self.consume(Kind::RParen, "Expect ')' after condition.")?;

        // Both arms pop the condition: the then-branch right away, the
        // else-branch after the jump lands on its side.
        let then_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit(Opcode::Pop);
        self.statement()?;
        let else_jump = self.emit_jump(Opcode::Jump);
        self.patch_jump(then_jump)?;
        self.emit(Opcode::Pop);
        if self.advance_when(Kind::Else).is_some() {
            self.statement()?;
        }
        self.patch_jump(else_jump)
    }

    fn return_statement(&mut self, tok: &Token) -> Result<(), ParseError> {
        if self.unit().kind == FunKind::Script {
            return Err(ParseError::at(
                tok.pos,
                &tok.lexeme,
                "Can't return from top-level code.",
            ));
        }
        if self.advance_when(Kind::Semicolon).is_some() {
            self.emit_return();
            return Ok(());
        }
        if self.unit().kind == FunKind::Initializer {
            return Err(ParseError::at(
                tok.pos,
                &tok.lexeme,
                "Can't return a value from an initializer.",
            ));
        }
        self.expression()?;
        self.consume(Kind::Semicolon, "Expect ';' after return value.")?;
        self.emit(Opcode::Return);
        Ok(())
    }

    fn while_statement(&mut self) -> Result<(), ParseError> {
        let loop_start = self.chunk().len();
        self.consume(Kind::LParen, "Expect '(' after 'while'.")?;
        self.expression()?;
        self.consume(Kind::RParen, "Expect ')' after condition.")?;

        let exit_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit(Opcode::Pop);
        self.statement()?;
        self.emit_loop(loop_start)?;
        self.patch_jump(exit_jump)?;
        self.emit(Opcode::Pop);
        Ok(())
    }

    fn for_statement(&mut self) -> Result<(), ParseError> {
        self.begin_scope();
        let body = self.for_inner();
        self.end_scope();
        body
    }

    fn for_inner(&mut self) -> Result<(), ParseError> {
        self.consume(Kind::LParen, "Expect '(' after 'for'.")?;
        if self.advance_when(Kind::Semicolon).is_some() {
            // No initializer.
        } else if self.advance_when(Kind::Var).is_some() {
            self.var_declaration()?;
        } else {
            self.expression_statement()?;
        }

        let mut loop_start = self.chunk().len();
        let mut exit_jump = None;
        if self.advance_when(Kind::Semicolon).is_none() {
            self.expression()?;
            self.consume(Kind::Semicolon, "Expect ';' after loop condition.")?;
            exit_jump = Some(self.emit_jump(Opcode::JumpIfFalse));
            self.emit(Opcode::Pop);
        }

        if self.advance_when(Kind::RParen).is_none() {
            // The increment textually precedes the body but runs after it:
            // jump over it now, run it on the way back to the condition.
            let body_jump = self.emit_jump(Opcode::Jump);
            let increment_start = self.chunk().len();
            self.expression()?;
            self.emit(Opcode::Pop);
            self.consume(Kind::RParen, "Expect ')' after for clauses.")?;
            self.emit_loop(loop_start)?;
            loop_start = increment_start;
            self.patch_jump(body_jump)?;
        }

        self.statement()?;
        self.emit_loop(loop_start)?;
        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump)?;
            self.emit(Opcode::Pop);
        }
        Ok(())
    }

    // ----- expressions -----

    fn expression(&mut self) -> Result<(), ParseError> {
        self.parse_precedence(Precedence::Assignment)
    }

    fn parse_precedence(&mut self, precedence: Precedence) -> Result<(), ParseError> {
        let tok = self.advance()?;
        let can_assign = precedence <= Precedence::Assignment;
        self.prefix_rule(&tok, can_assign)?;

        loop {
            match self.peek() {
                None => break,
                Some(tok) if precedence > Precedence::of(tok.kind) => break,
                _ => {}
            }
            let tok = self.advance().expect("peek returned a token");
            self.infix_rule(&tok, can_assign)?;
        }

        if can_assign {
            if let Some(eq) = self.advance_when(Kind::Equal) {
                return Err(ParseError::at(
                    eq.pos,
                    &eq.lexeme,
                    "Invalid assignment target.",
                ));
            }
        }
        Ok(())
    }

    fn prefix_rule(&mut self, tok: &Token, can_assign: bool) -> Result<(), ParseError> {
        match tok.kind {
            Kind::LParen => self.grouping(),
            Kind::Minus | Kind::Bang => self.unary(tok),
            Kind::Number => self.number(tok),
            Kind::Str => self.string(tok),
            Kind::False | Kind::Nil | Kind::True => self.literal(tok),
            Kind::Ident => self.variable(tok, can_assign),
            Kind::This => self.this_expression(tok),
            Kind::Super => self.super_expression(tok),
            _ => Err(ParseError::at(tok.pos, &tok.lexeme, "Expect expression.")),
        }
    }

    fn infix_rule(&mut self, tok: &Token, can_assign: bool) -> Result<(), ParseError> {
        match tok.kind {
            Kind::Minus
            | Kind::Plus
            | Kind::Slash
            | Kind::Star
            | Kind::BangEqual
            | Kind::EqualEqual
            | Kind::Greater
            | Kind::GreaterEqual
            | Kind::Less
            | Kind::LessEqual => self.binary(tok),
            Kind::And => self.and_expression(),
            Kind::Or => self.or_expression(),
            Kind::LParen => self.call(tok),
            Kind::Dot => self.dot(tok, can_assign),
            _ => Err(ParseError::at(tok.pos, &tok.lexeme, "Expect expression.")),
        }
    }

    fn grouping(&mut self) -> Result<(), ParseError> {
        self.expression()?;
        self.consume(Kind::RParen, "Expect ')' after expression.")?;
        Ok(())
    }

    fn unary(&mut self, operator: &Token) -> Result<(), ParseError> {
        self.parse_precedence(Precedence::Unary)?;
        match operator.kind {
            Kind::Bang => self.chunk().write_op(Opcode::Not, operator.pos),
            Kind::Minus => self.chunk().write_op(Opcode::Negate, operator.pos),
            _ => unreachable!("Rule table is wrong."),
        }
        Ok(())
    }

    fn binary(&mut self, operator: &Token) -> Result<(), ParseError> {
        self.parse_precedence(Precedence::of(operator.kind).next())?;
        let chunk = self.chunk();
        match operator.kind {
            Kind::BangEqual => {
                chunk.write_op(Opcode::Equal, operator.pos);
                chunk.write_op(Opcode::Not, operator.pos);
            }
            Kind::EqualEqual => chunk.write_op(Opcode::Equal, operator.pos),
            Kind::Greater => chunk.write_op(Opcode::Greater, operator.pos),
            Kind::GreaterEqual => {
                chunk.write_op(Opcode::Less, operator.pos);
                chunk.write_op(Opcode::Not, operator.pos);
            }
            Kind::Less => chunk.write_op(Opcode::Less, operator.pos),
            Kind::LessEqual => {
                chunk.write_op(Opcode::Greater, operator.pos);
                chunk.write_op(Opcode::Not, operator.pos);
            }
            Kind::Plus => chunk.write_op(Opcode::Add, operator.pos),
            Kind::Minus => chunk.write_op(Opcode::Subtract, operator.pos),
            Kind::Star => chunk.write_op(Opcode::Multiply, operator.pos),
            Kind::Slash => chunk.write_op(Opcode::Divide, operator.pos),
            _ => unreachable!("Rule table is wrong."),
        }
        Ok(())
    }

    fn and_expression(&mut self) -> Result<(), ParseError> {
        let end_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit(Opcode::Pop);
        self.parse_precedence(Precedence::And)?;
        self.patch_jump(end_jump)
    }

    fn or_expression(&mut self) -> Result<(), ParseError> {
        let else_jump = self.emit_jump(Opcode::JumpIfFalse);
        let end_jump = self.emit_jump(Opcode::Jump);
        self.patch_jump(else_jump)?;
        self.emit(Opcode::Pop);
        self.parse_precedence(Precedence::Or)?;
        self.patch_jump(end_jump)
    }

    fn call(&mut self, tok: &Token) -> Result<(), ParseError> {
        let argc = self.argument_list()?;
        self.chunk().write_op(Opcode::Call, tok.pos);
        self.emit_byte(argc);
        Ok(())
    }

    fn dot(&mut self, tok: &Token, can_assign: bool) -> Result<(), ParseError> {
        let name = self.consume(Kind::Ident, "Expect property name after '.'.")?;
        let name_idx = self.identifier_constant(&name)?;
        if can_assign && self.advance_when(Kind::Equal).is_some() {
            self.expression()?;
            self.emit_op_byte(Opcode::SetProperty, name_idx);
        } else if self.advance_when(Kind::LParen).is_some() {
            let argc = self.argument_list()?;
            self.chunk().write_op(Opcode::Invoke, tok.pos);
            self.emit_byte(name_idx);
            self.emit_byte(argc);
        } else {
            self.emit_op_byte(Opcode::GetProperty, name_idx);
        }
        Ok(())
    }

    fn argument_list(&mut self) -> Result<u8, ParseError> {
        let mut argc: usize = 0;
        if !self.check(Kind::RParen) {
            loop {
                self.expression()?;
                if argc >= MAX_PARAMS {
                    return Err(self.error("Can't have more than 255 arguments."));
                }
                argc += 1;
                if self.advance_when(Kind::Comma).is_none() {
                    break;
                }
            }
        }
        self.consume(Kind::RParen, "Expect ')' after arguments.")?;
        Ok(argc as u8)
    }

    fn variable(&mut self, tok: &Token, can_assign: bool) -> Result<(), ParseError> {
        self.named_variable(&tok.lexeme, can_assign)
    }

    fn this_expression(&mut self, tok: &Token) -> Result<(), ParseError> {
        if self.classes.is_empty() {
            return Err(ParseError::at(
                tok.pos,
                &tok.lexeme,
                "Can't use 'this' outside of a class.",
            ));
        }
        self.named_variable("this", false)
    }

    fn super_expression(&mut self, tok: &Token) -> Result<(), ParseError> {
        match self.classes.last() {
            None => {
                return Err(ParseError::at(
                    tok.pos,
                    &tok.lexeme,
                    "Can't use 'super' outside of a class.",
                ));
            }
            Some(class) if !class.has_superclass => {
                return Err(ParseError::at(
                    tok.pos,
                    &tok.lexeme,
                    "Can't use 'super' in a class with no superclass.",
                ));
            }
            Some(_) => {}
        }

        self.consume(Kind::Dot, "Expect '.' after 'super'.")?;
        let method = self.consume(Kind::Ident, "Expect superclass method name.")?;
        let name_idx = self.identifier_constant(&method)?;

        self.named_variable("this", false)?;
        if self.advance_when(Kind::LParen).is_some() {
            let argc = self.argument_list()?;
            self.named_variable("super", false)?;
            self.chunk().write_op(Opcode::SuperInvoke, tok.pos);
            self.emit_byte(name_idx);
            self.emit_byte(argc);
        } else {
            self.named_variable("super", false)?;
            self.emit_op_byte(Opcode::GetSuper, name_idx);
        }
        Ok(())
    }

    fn literal(&mut self, tok: &Token) -> Result<(), ParseError> {
        match tok.kind {
            Kind::False => self.chunk().write_op(Opcode::False, tok.pos),
            Kind::Nil => self.chunk().write_op(Opcode::Nil, tok.pos),
            Kind::True => self.chunk().write_op(Opcode::True, tok.pos),
            _ => unreachable!("Rule table is wrong."),
        }
        Ok(())
    }

    fn string(&mut self, tok: &Token) -> Result<(), ParseError> {
        let content = &tok.lexeme[1..tok.lexeme.len() - 1];
        let s = self.intern(content);
        let idx = self.make_constant(Value::Obj(s))?;
        self.chunk().write_op(Opcode::Constant, tok.pos);
        self.emit_byte(idx);
        Ok(())
    }

    fn number(&mut self, tok: &Token) -> Result<(), ParseError> {
        let value = tok
            .lexeme
            .parse()
            .expect("the scanner only produces valid number lexemes");
        let idx = self.make_constant(Value::Number(value))?;
        self.chunk().write_op(Opcode::Constant, tok.pos);
        self.emit_byte(idx);
        Ok(())
    }

    // ----- variables, scopes, upvalues -----

    fn named_variable(&mut self, name: &str, can_assign: bool) -> Result<(), ParseError> {
        let unit = self.units.len() - 1;
        let (get, set, arg) = if let Some(slot) = self.resolve_local(unit, name)? {
            (Opcode::GetLocal, Opcode::SetLocal, slot)
        } else if let Some(idx) = self.resolve_upvalue(unit, name)? {
            (Opcode::GetUpvalue, Opcode::SetUpvalue, idx)
        } else {
            let idx = self.intern_constant(name)?;
            (Opcode::GetGlobal, Opcode::SetGlobal, idx)
        };

        if can_assign && self.advance_when(Kind::Equal).is_some() {
            self.expression()?;
            self.emit_op_byte(set, arg);
        } else {
            self.emit_op_byte(get, arg);
        }
        Ok(())
    }

    /// Find `name` among a unit's locals. Depth -1 marks a variable whose
    /// own initializer is still being compiled.
    fn resolve_local(&mut self, unit: usize, name: &str) -> Result<Option<u8>, ParseError> {
        for (slot, local) in self.units[unit].locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    return Err(self.error("Can't read local variable in its own initializer."));
                }
                return Ok(Some(slot as u8));
            }
        }
        Ok(None)
    }

    /// Find `name` in an enclosing function, capturing it along the way:
    /// as a local of the immediately enclosing unit, or transitively as an
    /// upvalue of that unit.
    fn resolve_upvalue(&mut self, unit: usize, name: &str) -> Result<Option<u8>, ParseError> {
        if unit == 0 {
            return Ok(None);
        }
        if let Some(local) = self.resolve_local(unit - 1, name)? {
            self.units[unit - 1].locals[usize::from(local)].is_captured = true;
            return self.add_upvalue(unit, local, true).map(Some);
        }
        if let Some(upvalue) = self.resolve_upvalue(unit - 1, name)? {
            return self.add_upvalue(unit, upvalue, false).map(Some);
        }
        Ok(None)
    }

    fn add_upvalue(&mut self, unit: usize, index: u8, is_local: bool) -> Result<u8, ParseError> {
        let descriptor = UpvalueDescriptor { index, is_local };
        if let Some(existing) = self.units[unit]
            .upvalues
            .iter()
            .position(|&u| u == descriptor)
        {
            return Ok(existing as u8);
        }
        if self.units[unit].upvalues.len() >= MAX_UPVALUES {
            return Err(self.error("Too many closure variables in function."));
        }
        self.units[unit].upvalues.push(descriptor);
        let count = self.units[unit].upvalues.len();
        self.units[unit].fun.upvalue_count = count;
        Ok((count - 1) as u8)
    }

    /// Consume a variable name and declare it. Returns the name token and,
    /// for globals, the constant-pool index of the name.
    fn parse_variable(&mut self, message: &str) -> Result<(Token, Option<u8>), ParseError> {
        let name = self.consume(Kind::Ident, message)?;
        self.declare_variable(&name)?;
        if self.unit().scope_depth > 0 {
            return Ok((name, None));
        }
        let idx = self.identifier_constant(&name)?;
        Ok((name, Some(idx)))
    }

    fn declare_variable(&mut self, name: &Token) -> Result<(), ParseError> {
        if self.unit().scope_depth == 0 {
            return Ok(());
        }
        let unit = self.unit();
        for local in unit.locals.iter().rev() {
            if local.depth != -1 && local.depth < unit.scope_depth {
                break;
            }
            if local.name == name.lexeme {
                return Err(ParseError::at(
                    name.pos,
                    &name.lexeme,
                    "Already a variable with this name in this scope.",
                ));
            }
        }
        self.add_local(&name.lexeme)
    }

    fn add_local(&mut self, name: &str) -> Result<(), ParseError> {
        if self.unit().locals.len() >= MAX_LOCAL_VARIABLES {
            return Err(self.error("Too many local variables in function."));
        }
        self.unit().locals.push(Local {
            name: name.to_string(),
            depth: -1,
            is_captured: false,
        });
        Ok(())
    }

    fn mark_initialized(&mut self) {
        let unit = self.unit();
        if unit.scope_depth == 0 {
            return;
        }
        let depth = unit.scope_depth;
        unit.locals
            .last_mut()
            .expect("a local was declared before being initialized")
            .depth = depth;
    }

    fn define_variable(&mut self, global: Option<u8>) {
        match global {
            Some(idx) => self.emit_op_byte(Opcode::DefineGlobal, idx),
            None => self.mark_initialized(),
        }
    }

    fn begin_scope(&mut self) {
        self.unit().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.unit().scope_depth -= 1;
        loop {
            let unit = self.unit();
            let op = match unit.locals.last() {
                Some(local) if local.depth > unit.scope_depth => {
                    if local.is_captured {
                        Opcode::CloseUpvalue
                    } else {
                        Opcode::Pop
                    }
                }
                _ => break,
            };
            self.unit().locals.pop();
            self.emit(op);
        }
    }

    // ----- emission -----

    fn unit(&mut self) -> &mut CompileUnit {
        self.units.last_mut().expect("the unit stack is never empty")
    }

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.unit().fun.chunk
    }

    fn emit(&mut self, op: Opcode) {
        let pos = self.last_pos;
        self.chunk().write_op(op, pos);
    }

    fn emit_byte(&mut self, byte: u8) {
        let pos = self.last_pos;
        self.chunk().write(byte, pos);
    }

    fn emit_op_byte(&mut self, op: Opcode, operand: u8) {
        self.emit(op);
        self.emit_byte(operand);
    }

    /// Emit a forward jump with a placeholder operand and return the offset
    /// to patch once the target is known.
    fn emit_jump(&mut self, op: Opcode) -> usize {
        self.emit(op);
        let offset = self.chunk().len();
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        offset
    }

    fn patch_jump(&mut self, offset: usize) -> Result<(), ParseError> {
        if self.chunk().patch_jump(offset) {
            Ok(())
        } else {
            Err(self.error("Too much code to jump over."))
        }
    }

    fn emit_loop(&mut self, loop_start: usize) -> Result<(), ParseError> {
        self.emit(Opcode::Loop);
        // +2 skips the operand about to be written.
        let offset = self.chunk().len() - loop_start + 2;
        if offset > u16::MAX as usize {
            return Err(self.error("Loop body too large."));
        }
        self.emit_byte((offset >> 8) as u8);
        self.emit_byte((offset & 0xff) as u8);
        Ok(())
    }

    fn emit_return(&mut self) {
        if self.unit().kind == FunKind::Initializer {
            // An initializer implicitly returns its receiver.
            self.emit_op_byte(Opcode::GetLocal, 0);
        } else {
            self.emit(Opcode::Nil);
        }
        self.emit(Opcode::Return);
    }

    /// Seal the innermost unit and move its function into the heap.
    fn end_unit(&mut self) -> (ObjRef, Vec<UpvalueDescriptor>) {
        self.emit_return();
        // The finished function's constants are only rooted through the
        // unit, so give the collector its chance before popping it.
        let roots = CompilerRoots {
            units: &self.units,
            ambient: self.ambient,
        };
        self.heap.collect_if_needed(&roots);
        let unit = self.units.pop().expect("the unit stack is never empty");
        (self.heap.insert(Obj::Fun(unit.fun)), unit.upvalues)
    }

    fn intern(&mut self, s: &str) -> ObjRef {
        let roots = CompilerRoots {
            units: &self.units,
            ambient: self.ambient,
        };
        self.heap.intern(s, &roots)
    }

    fn identifier_constant(&mut self, name: &Token) -> Result<u8, ParseError> {
        self.intern_constant(&name.lexeme)
    }

    fn intern_constant(&mut self, name: &str) -> Result<u8, ParseError> {
        let s = self.intern(name);
        self.make_constant(Value::Obj(s))
    }

    fn make_constant(&mut self, value: Value) -> Result<u8, ParseError> {
        match self.chunk().add_constant(value) {
            Some(idx) => Ok(idx),
            None => Err(self.error("Too many constants in one chunk.")),
        }
    }

    /// An error blamed on the most recently consumed token.
    fn error(&self, message: &str) -> ParseError {
        ParseError::at(self.last_pos, &self.last_lexeme, message)
    }

    // ----- token plumbing -----

    fn synchronize(&mut self) {
        while self.peek().is_some() {
            let tok = self.advance().expect("a token was peeked");
            if tok.kind == Kind::Semicolon {
                return;
            }
            if let Some(tok) = self.peek() {
                match tok.kind {
                    Kind::Class
                    | Kind::Fun
                    | Kind::Var
                    | Kind::For
                    | Kind::If
                    | Kind::While
                    | Kind::Print
                    | Kind::Return => return,
                    _ => {}
                }
            }
        }
    }

    fn advance(&mut self) -> Result<Token, ParseError> {
        self.skip_scan_errors();
        match self.tokens.next() {
            Some(Ok(tok)) => {
                self.last_pos = tok.pos;
                self.last_lexeme.clone_from(&tok.lexeme);
                Ok(tok)
            }
            Some(Err(_)) => unreachable!("scan errors were skipped"),
            None => Err(ParseError::at_end(self.last_pos, "Expect expression.")),
        }
    }

    fn advance_when(&mut self, kind: Kind) -> Option<Token> {
        if self.check(kind) {
            return Some(self.advance().expect("a token was peeked"));
        }
        None
    }

    fn check(&mut self, kind: Kind) -> bool {
        matches!(self.peek(), Some(tok) if tok.kind == kind)
    }

    fn peek(&mut self) -> Option<&Token> {
        self.skip_scan_errors();
        self.tokens.peek().map(|peeked| match peeked {
            Ok(tok) => tok,
            Err(_) => unreachable!("scan errors were skipped"),
        })
    }

    fn skip_scan_errors(&mut self) {
        while let Some(Err(err)) = self.tokens.peek() {
            eprintln!("{}", err);
            self.had_error = true;
            self.tokens.next();
        }
    }

    fn consume(&mut self, kind: Kind, message: &str) -> Result<Token, ParseError> {
        match self.peek() {
            Some(tok) if tok.kind == kind => self.advance(),
            Some(tok) => Err(ParseError::at(tok.pos, &tok.lexeme, message)),
            None => Err(ParseError::at_end(self.last_pos, message)),
        }
    }
}

/// All precedence levels in Lox, lowest first.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    /// No precedence
    None,
    /// Operator `=`
    Assignment,
    /// Operator `or`
    Or,
    /// Operator `and`
    And,
    /// Operator `==` `!=`
    Equality,
    /// Operator `<` `>` `<=` `>=`
    Comparison,
    /// Operator `+` `-`
    Term,
    /// Operator `*` `/`
    Factor,
    /// Operator `!` `-`
    Unary,
    /// Operator `.` `()`
    Call,
    /// Literals and keywords
    Primary,
}

impl Precedence {
    /// The immediately higher precedence level.
    fn next(&self) -> Self {
        match self {
            Self::None => Self::Assignment,
            Self::Assignment => Self::Or,
            Self::Or => Self::And,
            Self::And => Self::Equality,
            Self::Equality => Self::Comparison,
            Self::Comparison => Self::Term,
            Self::Term => Self::Factor,
            Self::Factor => Self::Unary,
            Self::Unary => Self::Call,
            Self::Call => Self::Primary,
            Self::Primary => Self::Primary,
        }
    }

    /// The precedence a token has in infix position.
    fn of(kind: Kind) -> Self {
        match kind {
            Kind::Or => Precedence::Or,
            Kind::And => Precedence::And,
            Kind::BangEqual | Kind::EqualEqual => Precedence::Equality,
            Kind::Greater | Kind::GreaterEqual | Kind::Less | Kind::LessEqual => {
                Precedence::Comparison
            }
            Kind::Minus | Kind::Plus => Precedence::Term,
            Kind::Slash | Kind::Star => Precedence::Factor,
            Kind::LParen | Kind::Dot => Precedence::Call,
            _ => Self::None,
        }
    }
}
