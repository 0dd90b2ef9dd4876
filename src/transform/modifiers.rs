// retrace_interceptor::transform::modifiers
//
// The node-rewrite rules of the script transformer, implemented as an SWC
// `VisitMut`.  Children are always rewritten before their parent so a
// generated subtree is never re-visited; the only rules that assemble nodes
// up front (for-in, bare `location =`) visit their components manually
// first.
//
// Rules:
//   ● bare `location`                  → __get$Loc(location)
//   ● member get  obj.p / obj[k]       → __get$(obj, "p") when p needs it
//   ● member set  obj.p = v            → __set$(obj, "p", v)
//   ● compound    obj.p += v           → desugared to obj.p = obj.p + v
//   ● bare        location = v         → IIFE trying __set$Loc first
//   ● method call obj.write(…) etc.    → __call$(obj, "write", [...])
//   ● eval / setTimeout / setInterval  → string argument wrapped in
//     (direct, .call, .apply, member)    __proc$Script(…)
//   ● new Function(…, body)            → body wrapped in __proc$Script(…)
//   ● for (x.y in obj)                 → temp var + __set$ inside the loop
//   ● consecutive document.write calls → trailing begin/end marker args
//
// Native semantics are preserved where the member expression is a call
// callee, a `delete`/`++`/`--` operand, or a `new` target.

use swc_ecma_ast::*;
use swc_ecma_visit::{VisitMut, VisitMutWith};

use super::instruction;

pub struct InstrumentationVisitor {
    /// Depth of function scopes that re-declare `location`.
    location_shadow_depth: usize,
}

impl InstrumentationVisitor {
    pub fn new() -> Self {
        InstrumentationVisitor {
            location_shadow_depth: 0,
        }
    }

    // ---- AST builders -----------------------------------------------------

    fn ident(name: &str) -> Ident {
        Ident::new(name.into(), Default::default(), Default::default())
    }

    fn str_lit(value: &str) -> Expr {
        Expr::Lit(Lit::Str(Str {
            span: Default::default(),
            value: value.into(),
            raw: None,
        }))
    }

    fn bridge_call(name: &str, args: Vec<Expr>) -> Expr {
        Expr::Call(CallExpr {
            span: Default::default(),
            callee: Callee::Expr(Box::new(Expr::Ident(Self::ident(name)))),
            args: args
                .into_iter()
                .map(|expr| ExprOrSpread {
                    spread: None,
                    expr: Box::new(expr),
                })
                .collect(),
            type_args: None,
            ..Default::default()
        })
    }

    /// `__get$Loc(location)`
    fn get_location_call() -> Expr {
        Self::bridge_call(
            instruction::GET_LOCATION,
            vec![Expr::Ident(Self::ident("location"))],
        )
    }

    /// `__proc$Script(expr)`
    fn process_script_call(expr: Expr) -> Expr {
        Self::bridge_call(instruction::PROCESS_SCRIPT, vec![expr])
    }

    /// Key expression of a member access: string literal for `.p`, the
    /// computed expression for `[k]`.  `None` for private names.
    fn member_key(prop: &MemberProp) -> Option<Expr> {
        match prop {
            MemberProp::Ident(name) => Some(Self::str_lit(name.sym.as_ref())),
            MemberProp::Computed(computed) => Some((*computed.expr).clone()),
            MemberProp::PrivateName(_) => None,
        }
    }

    /// Does this member access need bridging?  Identifier keys are checked
    /// against the wrappable set; computed keys are always bridged because
    /// the name is only known at runtime.
    fn member_needs_bridge(prop: &MemberProp) -> bool {
        match prop {
            MemberProp::Ident(name) => {
                instruction::should_instrument_property(name.sym.as_ref())
            }
            MemberProp::Computed(computed) => match &*computed.expr {
                Expr::Lit(Lit::Str(s)) => {
                    instruction::should_instrument_property(s.value.as_ref())
                }
                Expr::Lit(_) => false,
                _ => true,
            },
            MemberProp::PrivateName(_) => false,
        }
    }

    // ---- location --------------------------------------------------------

    fn is_bare_location(expr: &Expr) -> bool {
        matches!(expr, Expr::Ident(id) if id.sym.as_ref() == "location")
    }

    /// `(function(__v) { return __set$Loc(location, __v) || (location = __v); }).call(this, value)`
    ///
    /// Falls back to the real assignment when the set-location hook reports
    /// the value is not a location override, preserving browser navigation
    /// semantics exactly.
    fn location_assignment(value: Expr) -> Expr {
        let param_name = "__v";
        let set_loc = Self::bridge_call(
            instruction::SET_LOCATION,
            vec![
                Expr::Ident(Self::ident("location")),
                Expr::Ident(Self::ident(param_name)),
            ],
        );
        let fallback = Expr::Paren(ParenExpr {
            span: Default::default(),
            expr: Box::new(Expr::Assign(AssignExpr {
                span: Default::default(),
                op: AssignOp::Assign,
                left: AssignTarget::Simple(SimpleAssignTarget::Ident(BindingIdent {
                    id: Self::ident("location"),
                    type_ann: None,
                })),
                right: Box::new(Expr::Ident(Self::ident(param_name))),
            })),
        });
        let ret = Stmt::Return(ReturnStmt {
            span: Default::default(),
            arg: Some(Box::new(Expr::Bin(BinExpr {
                span: Default::default(),
                op: BinaryOp::LogicalOr,
                left: Box::new(set_loc),
                right: Box::new(fallback),
            }))),
        });
        let func = Expr::Fn(FnExpr {
            ident: None,
            function: Box::new(Function {
                params: vec![Param {
                    span: Default::default(),
                    decorators: vec![],
                    pat: Pat::Ident(BindingIdent {
                        id: Self::ident(param_name),
                        type_ann: None,
                    }),
                }],
                decorators: vec![],
                span: Default::default(),
                body: Some(BlockStmt {
                    span: Default::default(),
                    stmts: vec![ret],
                    ..Default::default()
                }),
                is_generator: false,
                is_async: false,
                type_params: None,
                return_type: None,
                ..Default::default()
            }),
        });
        Expr::Call(CallExpr {
            span: Default::default(),
            callee: Callee::Expr(Box::new(Expr::Member(MemberExpr {
                span: Default::default(),
                obj: Box::new(Expr::Paren(ParenExpr {
                    span: Default::default(),
                    expr: Box::new(func),
                })),
                prop: MemberProp::Ident(IdentName::new("call".into(), Default::default())),
            }))),
            args: vec![
                ExprOrSpread {
                    spread: None,
                    expr: Box::new(Expr::This(ThisExpr {
                        span: Default::default(),
                    })),
                },
                ExprOrSpread {
                    spread: None,
                    expr: Box::new(value),
                },
            ],
            type_args: None,
            ..Default::default()
        })
    }

    /// Recursive scan for a `var`/`let`/`const` named `location`, stopping
    /// at nested function boundaries.
    fn declares_location(stmts: &[Stmt]) -> bool {
        fn pat_binds_location(pat: &Pat) -> bool {
            match pat {
                Pat::Ident(id) => id.id.sym.as_ref() == "location",
                Pat::Array(arr) => arr
                    .elems
                    .iter()
                    .flatten()
                    .any(pat_binds_location),
                Pat::Object(obj) => obj.props.iter().any(|p| match p {
                    ObjectPatProp::KeyValue(kv) => pat_binds_location(&kv.value),
                    ObjectPatProp::Assign(a) => a.key.sym.as_ref() == "location",
                    ObjectPatProp::Rest(r) => pat_binds_location(&r.arg),
                }),
                Pat::Assign(a) => pat_binds_location(&a.left),
                Pat::Rest(r) => pat_binds_location(&r.arg),
                _ => false,
            }
        }

        fn scan(stmt: &Stmt) -> bool {
            match stmt {
                Stmt::Decl(Decl::Var(var)) => {
                    var.decls.iter().any(|d| pat_binds_location(&d.name))
                }
                Stmt::Block(block) => block.stmts.iter().any(scan),
                Stmt::If(s) => {
                    scan(&s.cons) || s.alt.as_deref().map(scan).unwrap_or(false)
                }
                Stmt::For(s) => scan(&s.body),
                Stmt::ForIn(s) => scan(&s.body),
                Stmt::ForOf(s) => scan(&s.body),
                Stmt::While(s) => scan(&s.body),
                Stmt::DoWhile(s) => scan(&s.body),
                Stmt::Try(s) => {
                    s.block.stmts.iter().any(scan)
                        || s.handler
                            .as_ref()
                            .map(|h| h.body.stmts.iter().any(scan))
                            .unwrap_or(false)
                }
                Stmt::Labeled(s) => scan(&s.body),
                _ => false,
            }
        }

        stmts.iter().any(scan)
    }

    fn function_shadows_location(params: &[Pat], body: Option<&[Stmt]>) -> bool {
        let param_shadow = params.iter().any(|p| match p {
            Pat::Ident(id) => id.id.sym.as_ref() == "location",
            _ => false,
        });
        param_shadow || body.map(Self::declares_location).unwrap_or(false)
    }

    // ---- call handling ---------------------------------------------------

    fn is_eval_like(name: &str) -> bool {
        matches!(name, "eval" | "setTimeout" | "setInterval")
    }

    /// Visit a call's pieces with the callee-member exemption: a member
    /// expression in callee position keeps native semantics (`this`
    /// binding), so only its object and computed key are rewritten.
    fn visit_call_children(&mut self, call: &mut CallExpr) {
        for arg in call.args.iter_mut() {
            arg.expr.visit_mut_with(self);
        }
        if let Callee::Expr(callee) = &mut call.callee {
            match &mut **callee {
                Expr::Member(member) => {
                    member.obj.visit_mut_with(self);
                    if let MemberProp::Computed(computed) = &mut member.prop {
                        computed.expr.visit_mut_with(self);
                    }
                }
                other => other.visit_mut_with(self),
            }
        }
    }

    fn wrap_call_arg(call: &mut CallExpr, index: usize) {
        if let Some(arg) = call.args.get_mut(index) {
            if arg.spread.is_none() {
                let inner = (*arg.expr).clone();
                arg.expr = Box::new(Self::process_script_call(inner));
            }
        }
    }

    /// Apply eval/timer/method rules.  Returns a replacement when the whole
    /// call must become a `__call$` dispatch.
    fn rewrite_call(&mut self, call: &mut CallExpr) -> Option<Expr> {
        let callee_expr = match &call.callee {
            Callee::Expr(e) => &**e,
            _ => return None,
        };

        match callee_expr {
            // eval("…"), setTimeout("…", t), setInterval("…", t),
            // Function("…") — the code-bearing argument goes through
            // __proc$Script; the hook no-ops on non-strings so wrapping is
            // unconditional.
            Expr::Ident(ident) => {
                let name = ident.sym.as_ref();
                if Self::is_eval_like(name) {
                    Self::wrap_call_arg(call, 0);
                } else if name == "Function" && !call.args.is_empty() {
                    let last = call.args.len() - 1;
                    Self::wrap_call_arg(call, last);
                }
                None
            }

            Expr::Member(member) => {
                let method = match &member.prop {
                    MemberProp::Ident(name) => Some(name.sym.to_string()),
                    _ => None,
                };

                if let Some(method) = &method {
                    // window.eval("…"), obj.setTimeout("…", t)
                    if Self::is_eval_like(method) {
                        Self::wrap_call_arg(call, 0);
                        return None;
                    }

                    // eval.call(ctx, "…") / setTimeout.apply(ctx, ["…", t])
                    if method == "call" || method == "apply" {
                        if let Some(target) = Self::eval_like_target(&member.obj) {
                            if target {
                                if method == "call" {
                                    Self::wrap_call_arg(call, 1);
                                } else if let Some(arg) = call.args.get_mut(1) {
                                    if let Expr::Array(arr) = &mut *arg.expr {
                                        if let Some(Some(first)) = arr.elems.first_mut().map(|e| e.as_mut()) {
                                            let inner = (*first.expr).clone();
                                            first.expr =
                                                Box::new(Self::process_script_call(inner));
                                        }
                                    }
                                }
                            }
                        }
                        return None;
                    }

                    // obj.postMessage(…), doc.write(…), doc.writeln(…)
                    if instruction::should_instrument_method(method) {
                        let owner = (*member.obj).clone();
                        let args = Expr::Array(ArrayLit {
                            span: Default::default(),
                            elems: call
                                .args
                                .iter()
                                .map(|a| {
                                    Some(ExprOrSpread {
                                        spread: a.spread,
                                        expr: a.expr.clone(),
                                    })
                                })
                                .collect(),
                        });
                        return Some(Self::bridge_call(
                            instruction::CALL_METHOD,
                            vec![owner, Self::str_lit(method), args],
                        ));
                    }
                }
                None
            }

            _ => None,
        }
    }

    /// True when the expression names an eval-like function (`eval`,
    /// `window.setTimeout`, …).
    fn eval_like_target(expr: &Expr) -> Option<bool> {
        match expr {
            Expr::Ident(id) => Some(Self::is_eval_like(id.sym.as_ref())),
            Expr::Member(m) => match &m.prop {
                MemberProp::Ident(name) => Some(Self::is_eval_like(name.sym.as_ref())),
                _ => None,
            },
            _ => None,
        }
    }

    // ---- assignment handling ---------------------------------------------

    /// Desugar `target op= value` into `target = target + value` so the
    /// plain get/set rules apply uniformly.
    fn desugar_compound(assign: &mut AssignExpr) {
        let bin_op = match assign.op {
            AssignOp::AddAssign => BinaryOp::Add,
            _ => return,
        };
        let target_expr = match &assign.left {
            AssignTarget::Simple(SimpleAssignTarget::Member(m)) => Expr::Member(m.clone()),
            AssignTarget::Simple(SimpleAssignTarget::Ident(id)) => {
                Expr::Ident(id.id.clone())
            }
            _ => return,
        };
        let needs_desugar = match &target_expr {
            Expr::Member(m) => Self::member_needs_bridge(&m.prop),
            Expr::Ident(id) => id.sym.as_ref() == "location",
            _ => false,
        };
        if !needs_desugar {
            return;
        }
        let rhs = (*assign.right).clone();
        assign.op = AssignOp::Assign;
        assign.right = Box::new(Expr::Bin(BinExpr {
            span: Default::default(),
            op: bin_op,
            left: Box::new(target_expr),
            right: Box::new(rhs),
        }));
    }

    /// Handle `Expr::Assign`; returns a replacement expression when the
    /// assignment becomes a dispatch call.
    fn rewrite_assign(&mut self, assign: &mut AssignExpr) -> Option<Expr> {
        Self::desugar_compound(assign);
        if assign.op != AssignOp::Assign {
            // Other compound operators keep native semantics.
            assign.visit_mut_children_with(self);
            return None;
        }

        match &mut assign.left {
            // obj.p = v  /  obj[k] = v
            AssignTarget::Simple(SimpleAssignTarget::Member(member))
                if Self::member_needs_bridge(&member.prop) =>
            {
                member.obj.visit_mut_with(self);
                if let MemberProp::Computed(computed) = &mut member.prop {
                    computed.expr.visit_mut_with(self);
                }
                assign.right.visit_mut_with(self);

                let key = Self::member_key(&member.prop)?;
                let owner = (*member.obj).clone();
                let value = (*assign.right).clone();
                Some(Self::bridge_call(
                    instruction::SET_PROPERTY,
                    vec![owner, key, value],
                ))
            }

            // location = v
            AssignTarget::Simple(SimpleAssignTarget::Ident(id))
                if id.id.sym.as_ref() == "location" && self.location_shadow_depth == 0 =>
            {
                assign.right.visit_mut_with(self);
                let value = (*assign.right).clone();
                Some(Self::location_assignment(value))
            }

            _ => {
                assign.visit_mut_children_with(self);
                None
            }
        }
    }
}

impl VisitMut for InstrumentationVisitor {
    fn visit_mut_expr(&mut self, expr: &mut Expr) {
        match expr {
            Expr::Call(_) => {
                // Children first, with the callee-member exemption.
                if let Expr::Call(call) = expr {
                    self.visit_call_children(call);
                    if let Some(replacement) = self.rewrite_call(call) {
                        *expr = replacement;
                    }
                }
                return;
            }

            Expr::Assign(_) => {
                if let Expr::Assign(assign) = expr {
                    if let Some(replacement) = self.rewrite_assign(assign) {
                        *expr = replacement;
                    }
                }
                return;
            }

            // delete obj.p / obj.p++ / new C(): the member keeps native
            // semantics; only descend into its object.
            Expr::Unary(unary) if unary.op == UnaryOp::Delete => {
                if let Expr::Member(member) = &mut *unary.arg {
                    member.obj.visit_mut_with(self);
                    if let MemberProp::Computed(computed) = &mut member.prop {
                        computed.expr.visit_mut_with(self);
                    }
                } else {
                    unary.arg.visit_mut_with(self);
                }
                return;
            }
            Expr::Update(update) => {
                if let Expr::Member(member) = &mut *update.arg {
                    member.obj.visit_mut_with(self);
                    if let MemberProp::Computed(computed) = &mut member.prop {
                        computed.expr.visit_mut_with(self);
                    }
                } else {
                    update.arg.visit_mut_with(self);
                }
                return;
            }
            Expr::New(new_expr) => {
                if let Some(args) = &mut new_expr.args {
                    for arg in args.iter_mut() {
                        arg.expr.visit_mut_with(self);
                    }
                }
                match &mut *new_expr.callee {
                    Expr::Member(member) => {
                        member.obj.visit_mut_with(self);
                    }
                    other => other.visit_mut_with(self),
                }
                // new Function("…body")
                if let Expr::Ident(callee) = &*new_expr.callee {
                    if callee.sym.as_ref() == "Function" {
                        if let Some(args) = &mut new_expr.args {
                            if let Some(last) = args.last_mut() {
                                if last.spread.is_none() {
                                    let inner = (*last.expr).clone();
                                    last.expr = Box::new(Self::process_script_call(inner));
                                }
                            }
                        }
                    }
                }
                return;
            }

            _ => {}
        }

        expr.visit_mut_children_with(self);

        match expr {
            // bare `location` → __get$Loc(location)
            Expr::Ident(ident)
                if ident.sym.as_ref() == "location" && self.location_shadow_depth == 0 =>
            {
                *expr = Self::get_location_call();
            }

            // member get
            Expr::Member(member) if Self::member_needs_bridge(&member.prop) => {
                if let Some(key) = Self::member_key(&member.prop) {
                    let owner = (*member.obj).clone();
                    *expr = Self::bridge_call(instruction::GET_PROPERTY, vec![owner, key]);
                }
            }

            _ => {}
        }
    }

    fn visit_mut_function(&mut self, func: &mut Function) {
        let shadows = Self::function_shadows_location(
            &func.params.iter().map(|p| p.pat.clone()).collect::<Vec<_>>(),
            func.body.as_ref().map(|b| b.stmts.as_slice()),
        );
        if shadows {
            self.location_shadow_depth += 1;
        }
        func.visit_mut_children_with(self);
        if shadows {
            self.location_shadow_depth -= 1;
        }
    }

    fn visit_mut_arrow_expr(&mut self, arrow: &mut ArrowExpr) {
        let body_stmts = match &*arrow.body {
            BlockStmtOrExpr::BlockStmt(block) => Some(block.stmts.as_slice()),
            BlockStmtOrExpr::Expr(_) => None,
        };
        let shadows = Self::function_shadows_location(&arrow.params, body_stmts);
        if shadows {
            self.location_shadow_depth += 1;
        }
        arrow.visit_mut_children_with(self);
        if shadows {
            self.location_shadow_depth -= 1;
        }
    }

    // for (x.y in obj) body  →  for (var __set$temp in obj) { __set$(x, "y", __set$temp); body }
    fn visit_mut_stmt(&mut self, stmt: &mut Stmt) {
        let rewrite = match stmt {
            Stmt::ForIn(for_in) => matches!(
                &for_in.left,
                ForHead::Pat(pat) if matches!(&**pat, Pat::Expr(e) if matches!(&**e, Expr::Member(_)))
            ),
            _ => false,
        };

        if !rewrite {
            stmt.visit_mut_children_with(self);
            return;
        }

        if let Stmt::ForIn(for_in) = stmt {
            for_in.right.visit_mut_with(self);
            for_in.body.visit_mut_with(self);

            let member = match &mut for_in.left {
                ForHead::Pat(pat) => match &mut **pat {
                    Pat::Expr(expr) => match &mut **expr {
                        Expr::Member(member) => {
                            member.obj.visit_mut_with(self);
                            if let MemberProp::Computed(computed) = &mut member.prop {
                                computed.expr.visit_mut_with(self);
                            }
                            member.clone()
                        }
                        _ => unreachable!(),
                    },
                    _ => unreachable!(),
                },
                _ => unreachable!(),
            };

            let key = match Self::member_key(&member.prop) {
                Some(k) => k,
                None => return,
            };
            let set_stmt = Stmt::Expr(ExprStmt {
                span: Default::default(),
                expr: Box::new(Self::bridge_call(
                    instruction::SET_PROPERTY,
                    vec![
                        (*member.obj).clone(),
                        key,
                        Expr::Ident(Self::ident(instruction::FOR_IN_TEMP_VAR)),
                    ],
                )),
            });

            for_in.left = ForHead::VarDecl(Box::new(VarDecl {
                span: Default::default(),
                kind: VarDeclKind::Var,
                declare: false,
                decls: vec![VarDeclarator {
                    span: Default::default(),
                    name: Pat::Ident(BindingIdent {
                        id: Self::ident(instruction::FOR_IN_TEMP_VAR),
                        type_ann: None,
                    }),
                    init: None,
                    definite: false,
                }],
                ..Default::default()
            }));

            let original_body = std::mem::replace(
                &mut *for_in.body,
                Stmt::Empty(EmptyStmt {
                    span: Default::default(),
                }),
            );
            let mut stmts = vec![set_stmt];
            match original_body {
                Stmt::Block(block) => stmts.extend(block.stmts),
                other => stmts.push(other),
            }
            *for_in.body = Stmt::Block(BlockStmt {
                span: Default::default(),
                stmts,
                ..Default::default()
            });
        }
    }

    // Consecutive document.write/writeln statements get begin/end marker
    // arguments before the method-call rewrite sees them, so the runtime
    // can buffer the whole sequence and flush it atomically.
    fn visit_mut_stmts(&mut self, stmts: &mut Vec<Stmt>) {
        mark_write_sequences(stmts);
        stmts.visit_mut_children_with(self);
    }
}

/// True for an expression statement of shape `obj.write(…)` / `obj.writeln(…)`.
fn is_write_stmt(stmt: &Stmt) -> bool {
    let expr = match stmt {
        Stmt::Expr(e) => &e.expr,
        _ => return false,
    };
    let call = match &**expr {
        Expr::Call(c) => c,
        _ => return false,
    };
    let callee = match &call.callee {
        Callee::Expr(e) => &**e,
        _ => return false,
    };
    match callee {
        Expr::Member(m) => matches!(
            &m.prop,
            MemberProp::Ident(name) if name.sym.as_ref() == "write" || name.sym.as_ref() == "writeln"
        ),
        _ => false,
    }
}

fn push_marker_arg(stmt: &mut Stmt, marker: &str) {
    if let Stmt::Expr(expr_stmt) = stmt {
        if let Expr::Call(call) = &mut *expr_stmt.expr {
            call.args.push(ExprOrSpread {
                spread: None,
                expr: Box::new(InstrumentationVisitor::str_lit(marker)),
            });
        }
    }
}

fn mark_write_sequences(stmts: &mut [Stmt]) {
    let mut i = 0;
    while i < stmts.len() {
        if !is_write_stmt(&stmts[i]) {
            i += 1;
            continue;
        }
        let start = i;
        while i < stmts.len() && is_write_stmt(&stmts[i]) {
            i += 1;
        }
        let end = i - 1;
        if end > start {
            push_marker_arg(&mut stmts[start], instruction::DOCUMENT_WRITE_BEGIN);
            push_marker_arg(&mut stmts[end], instruction::DOCUMENT_WRITE_END);
        }
    }
}
