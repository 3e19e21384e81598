use std::collections::BTreeMap;

use indoc::indoc;
use pretty_assertions::assert_eq;
use xmlweave::{
    CompileErrorKind, Compiler, MissingValue, Template, Value,
};

fn obj(pairs: &[(&str, Value)]) -> Value {
    Value::Object(
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect::<BTreeMap<_, _>>(),
    )
}

// ── Plain markup ────────────────────────────────────────────────────────

#[test]
fn directive_free_markup_round_trips() {
    let compiler = Compiler::new();
    let out = compiler
        .compile_str(r#"<Doc a="1"><Child/>text</Doc>"#)
        .unwrap();
    assert_eq!(out, r#"<Doc a="1"><Child/>text</Doc>"#);
}

#[test]
fn entities_survive_the_round_trip() {
    let compiler = Compiler::new();
    let out = compiler
        .compile_str(r#"<P att="a &amp; b">1 &lt; 2</P>"#)
        .unwrap();
    assert_eq!(out, r#"<P att="a &amp; b">1 &lt; 2</P>"#);
}

// ── Interpolation ───────────────────────────────────────────────────────

#[test]
fn text_and_attributes_interpolate() {
    let mut compiler = Compiler::new();
    compiler.add_to_scope("name", "Ada");
    compiler.add_to_scope("n", 41i64);

    let out = compiler
        .compile_str(r#"<P id="{{name}}">{{n + 1}}</P>"#)
        .unwrap();
    assert_eq!(out, r#"<P id="Ada">42</P>"#);
}

#[test]
fn repeated_sites_all_resolve() {
    let mut compiler = Compiler::new();
    compiler.add_to_scope("n", 7i64);

    let out = compiler.compile_str("<P>{{n}} and {{n}}</P>").unwrap();
    assert_eq!(out, "<P>7 and 7</P>");
}

#[test]
fn injected_values_are_escaped_on_output() {
    let mut compiler = Compiler::new();
    compiler.add_to_scope("name", "<b>");

    let out = compiler.compile_str("<P>{{name}}</P>").unwrap();
    assert_eq!(out, "<P>&lt;b&gt;</P>");
}

#[test]
fn nested_paths_resolve() {
    let mut compiler = Compiler::new();
    compiler.add_to_scope(
        "person",
        obj(&[
            ("name", Value::from("Ada")),
            ("address", obj(&[("city", Value::from("London"))])),
        ]),
    );

    let out = compiler
        .compile_str("<P>{{person.name}} of {{person.address.city}}</P>")
        .unwrap();
    assert_eq!(out, "<P>Ada of London</P>");
}

// ── Repeaters ───────────────────────────────────────────────────────────

#[test]
fn repeater_over_literal_list() {
    let compiler = Compiler::new();
    let out = compiler
        .compile_str(r#"<Doc><Item ForEach="n in [1, 2, 3]">{{n}}</Item></Doc>"#)
        .unwrap();
    assert_eq!(out, "<Doc><Item>1</Item><Item>2</Item><Item>3</Item></Doc>");
}

#[test]
fn repeater_over_scope_array_of_objects() {
    let mut compiler = Compiler::new();
    compiler.add_to_scope(
        "products",
        Value::Array(vec![
            obj(&[("name", Value::from("Widget")), ("price", Value::from(9.99))]),
            obj(&[("name", Value::from("Gadget")), ("price", Value::from(1250.0))]),
        ]),
    );

    let out = compiler
        .compile_str(concat!(
            r#"<Products>"#,
            r#"<Product name="{{item.name}}" ForEach="item in products">{{item.price | currency}}</Product>"#,
            r#"</Products>"#,
        ))
        .unwrap();
    assert_eq!(
        out,
        concat!(
            r#"<Products>"#,
            r#"<Product name="Widget">$9.99</Product>"#,
            r#"<Product name="Gadget">$1,250.00</Product>"#,
            r#"</Products>"#,
        )
    );
}

#[test]
fn quoted_list_items_may_contain_commas() {
    let compiler = Compiler::new();
    let out = compiler
        .compile_str(r#"<D><I ForEach="s in ['a,b', 'c']">{{s}};</I></D>"#)
        .unwrap();
    assert_eq!(out, "<D><I>a,b;</I><I>c;</I></D>");
}

#[test]
fn repeater_accepts_tab_separated_directive() {
    let compiler = Compiler::new();
    let out = compiler
        .compile_str("<D><I ForEach=\"n\tin\t[1, 2]\">{{n}}</I></D>")
        .unwrap();
    assert_eq!(out, "<D><I>1</I><I>2</I></D>");
}

#[test]
fn synthetic_bindings_track_iteration() {
    let compiler = Compiler::new();
    let out = compiler
        .compile_str(r#"<L><I ForEach="x in [10, 20]">{{$index}}:{{x}}:{{$even}}</I></L>"#)
        .unwrap();
    assert_eq!(out, "<L><I>0:10:true</I><I>1:20:false</I></L>");
}

#[test]
fn parent_binding_reaches_the_enclosing_scope() {
    let compiler = Compiler::new();
    let out = compiler
        .compile_str(concat!(
            r#"<D><O ForEach="a in [1]">"#,
            r#"<I ForEach="a in [2]">{{a}}:{{$parent.a}}</I>"#,
            r#"</O></D>"#,
        ))
        .unwrap();
    assert_eq!(out, "<D><O><I>2:1</I></O></D>");
}

#[test]
fn inner_repeaters_shadow_and_restore() {
    let mut compiler = Compiler::new();
    compiler.add_to_scope("x", "root");

    let out = compiler
        .compile_str(concat!(
            r#"<D><I ForEach="x in ['inner']">{{x}}</I>"#,
            r#"<P>{{x}}</P></D>"#,
        ))
        .unwrap();
    assert_eq!(out, "<D><I>inner</I><P>root</P></D>");
}

#[test]
fn missing_repeater_source_runs_zero_times() {
    let compiler = Compiler::new();
    let out = compiler
        .compile_str(r#"<D><I ForEach="n in nothing">{{n}}</I></D>"#)
        .unwrap();
    assert_eq!(out, "<D></D>");
}

#[test]
fn malformed_repeater_is_fatal_even_in_lenient_mode() {
    let compiler = Compiler::new();
    let err = compiler
        .compile_str(r#"<D><I ForEach="products">x</I></D>"#)
        .unwrap_err();
    assert_eq!(err.kind, CompileErrorKind::DirectiveFormat);
}

// ── Conditionals ────────────────────────────────────────────────────────

#[test]
fn conditional_keeps_or_drops_the_subtree() {
    let mut compiler = Compiler::new();
    compiler.add_to_scope("flag", true);
    compiler.add_to_scope("count", 1i64);

    let out = compiler
        .compile_str(r#"<D><A If="flag">x</A><B If="count > 2">y</B></D>"#)
        .unwrap();
    assert_eq!(out, "<D><A>x</A></D>");
}

#[test]
fn condition_over_missing_name_fails_closed() {
    let compiler = Compiler::new();
    let out = compiler
        .compile_str(r#"<D><A If="nothing">x</A></D>"#)
        .unwrap();
    assert_eq!(out, "<D></D>");
}

#[test]
fn condition_sees_the_iteration_scope() {
    let compiler = Compiler::new();
    let out = compiler
        .compile_str(r#"<D><I ForEach="n in [1, 2, 3]" If="n > 1">{{n}}</I></D>"#)
        .unwrap();
    assert_eq!(out, "<D><I>2</I><I>3</I></D>");
}

// ── Lenient and strict modes ────────────────────────────────────────────

#[test]
fn failing_expression_keeps_its_site_verbatim() {
    let compiler = Compiler::new();
    let out = compiler.compile_str("<P>{{unknownVar + 1}}</P>").unwrap();
    assert_eq!(out, "<P>{{unknownVar + 1}}</P>");
}

#[test]
fn missing_name_alone_renders_the_configured_default() {
    let mut compiler = Compiler::new();
    let out = compiler.compile_str("<P>{{nothing}}</P>").unwrap();
    assert_eq!(out, "<P>false</P>");

    compiler.options_mut().missing = MissingValue::Empty;
    let out = compiler.compile_str("<P>{{nothing}}</P>").unwrap();
    assert_eq!(out, "<P></P>");
}

#[test]
fn unknown_filter_is_verbatim_then_fatal_in_strict() {
    let mut compiler = Compiler::new();
    compiler.add_to_scope("x", 1i64);

    let out = compiler.compile_str("<P>{{x | nope}}</P>").unwrap();
    assert_eq!(out, "<P>{{x | nope}}</P>");

    compiler.options_mut().strict = true;
    let err = compiler.compile_str("<P>{{x | nope}}</P>").unwrap_err();
    assert_eq!(err.kind, CompileErrorKind::UnknownFilter);
}

#[test]
fn strict_mode_surfaces_unresolved_paths() {
    let mut compiler = Compiler::new();
    compiler.options_mut().strict = true;

    let err = compiler.compile_str("<P>{{nothing}}</P>").unwrap_err();
    assert_eq!(err.kind, CompileErrorKind::UnresolvedPath);
}

#[test]
fn strict_mode_rejects_non_iterable_sources() {
    let mut compiler = Compiler::new();
    compiler.options_mut().strict = true;
    compiler.add_to_scope("name", "Ada");

    let err = compiler
        .compile_str(r#"<D><I ForEach="n in name">{{n}}</I></D>"#)
        .unwrap_err();
    assert_eq!(err.kind, CompileErrorKind::NotIterable);

    let err = compiler
        .compile_str(r#"<D><I ForEach="n in nothing">{{n}}</I></D>"#)
        .unwrap_err();
    assert_eq!(err.kind, CompileErrorKind::UnresolvedPath);
}

#[test]
fn malformed_markup_is_always_fatal() {
    let compiler = Compiler::new();
    let err = compiler.compile_str("<a><b></a>").unwrap_err();
    assert_eq!(err.kind, CompileErrorKind::Parse);
}

// ── Filters ─────────────────────────────────────────────────────────────

#[test]
fn host_registered_filters_apply() {
    let mut compiler = Compiler::new();
    compiler.add_to_scope("name", "Ada");
    compiler.register_filter("upper", |v| v.to_output_string().to_uppercase());

    let out = compiler.compile_str("<P>{{name | upper}}</P>").unwrap();
    assert_eq!(out, "<P>ADA</P>");
}

// ── Directive configuration ─────────────────────────────────────────────

#[test]
fn directive_names_are_configurable() {
    let mut compiler = Compiler::new();
    compiler.directives_mut().repeat_key = "x-for".to_string();
    compiler.directives_mut().if_key = "x-if".to_string();

    let out = compiler
        .compile_str(r#"<D><I x-for="n in [1, 2]" x-if="n > 1">{{n}}</I></D>"#)
        .unwrap();
    assert_eq!(out, "<D><I>2</I></D>");
}

#[test]
fn passthrough_can_carry_directives() {
    let compiler = Compiler::new();
    let out = compiler
        .compile_str(r#"<D><Template ForEach="n in [1, 2]"><A>{{n}}</A><B/></Template></D>"#)
        .unwrap();
    assert_eq!(out, "<D><A>1</A><B/><A>2</A><B/></D>");
}

#[test]
fn passthrough_element_emits_only_its_children() {
    let mut compiler = Compiler::new();
    compiler.add_to_scope("n", 1i64);

    let out = compiler
        .compile_str("<Template><A/><B>{{n}}</B></Template>")
        .unwrap();
    assert_eq!(out, "<A/><B>1</B>");
}

// ── Input and output forms ──────────────────────────────────────────────

#[test]
fn compile_from_reader() {
    let mut compiler = Compiler::new();
    compiler.add_to_scope("name", "Ada");

    let out = compiler
        .compile_reader("<Doc>{{name}}</Doc>".as_bytes())
        .unwrap();
    assert_eq!(out, "<Doc>Ada</Doc>");
}

#[test]
fn compile_from_file() {
    let path = std::env::temp_dir().join(format!("xmlweave-compile-{}.xml", std::process::id()));
    std::fs::write(&path, "<Doc>{{name}}</Doc>").unwrap();

    let mut compiler = Compiler::new();
    compiler.add_to_scope("name", "Ada");
    let out = compiler.compile_file(&path).unwrap();

    std::fs::remove_file(&path).ok();
    assert_eq!(out, "<Doc>Ada</Doc>");
}

#[test]
fn missing_file_reports_io() {
    let compiler = Compiler::new();
    let err = compiler
        .compile_file("/nonexistent/xmlweave.xml")
        .unwrap_err();
    assert_eq!(err.kind, CompileErrorKind::Io);
}

#[test]
fn indented_output() {
    let mut compiler = Compiler::new();
    compiler.options_mut().indent = Some(2);

    let out = compiler
        .compile_reader("<Doc><A>x</A><B/></Doc>".as_bytes())
        .unwrap();
    assert_eq!(
        out,
        indoc! {r#"
            <Doc>
              <A>x</A>
              <B/>
            </Doc>"#}
    );
}

#[test]
fn xml_declaration_is_opt_in() {
    let mut compiler = Compiler::new();
    compiler.options_mut().xml_declaration = true;

    let out = compiler.compile_reader("<Doc/>".as_bytes()).unwrap();
    assert_eq!(out, r#"<?xml version="1.0" encoding="UTF-8"?><Doc/>"#);
}

// ── Template reuse ──────────────────────────────────────────────────────

#[test]
fn one_template_compiles_against_many_scopes() {
    let template = Template::parse_str("<Hi>{{name}}</Hi>").unwrap();
    let mut compiler = Compiler::new();

    compiler.add_to_scope("name", "Ada");
    assert_eq!(compiler.compile(&template).unwrap(), "<Hi>Ada</Hi>");

    compiler.add_to_scope("name", "Grace");
    assert_eq!(compiler.compile(&template).unwrap(), "<Hi>Grace</Hi>");
}

#[test]
fn compile_node_renders_one_subtree() {
    let template = Template::parse_str(
        r#"<Doc><Head>skip</Head><Body If="show">{{n}}</Body></Doc>"#,
    )
    .unwrap();

    let doc = template.document();
    let root_element = doc.node(doc.root()).children[0];
    let body = doc.node(root_element).children[1];

    let mut compiler = Compiler::new();
    compiler.add_to_scope("show", true);
    compiler.add_to_scope("n", 7i64);

    assert_eq!(compiler.compile_node(&template, body).unwrap(), "<Body>7</Body>");

    compiler.add_to_scope("show", false);
    assert_eq!(compiler.compile_node(&template, body).unwrap(), "");
}

#[test]
fn eval_expression_resolves_against_the_scope() {
    let mut compiler = Compiler::new();
    compiler.add_to_scope("hp", 75i64);

    assert_eq!(compiler.eval_expression("1 + 2").unwrap(), Value::Number(3.0));
    assert_eq!(compiler.eval_expression("hp > 50").unwrap(), Value::Bool(true));
}

// ── A full document ─────────────────────────────────────────────────────

#[test]
fn invoice_document_resolves_end_to_end() {
    let mut compiler = Compiler::new();
    compiler.add_to_scope("customer", "Ada Lovelace");
    compiler.add_to_scope("paid", false);
    compiler.add_to_scope(
        "lines",
        Value::Array(vec![
            obj(&[("desc", Value::from("Analytical engine")), ("total", Value::from(1200.0))]),
            obj(&[("desc", Value::from("Punch cards")), ("total", Value::from(35.5))]),
        ]),
    );

    let template = indoc! {r#"
        <Invoice customer="{{customer}}"><Line n="{{$index}}" ForEach="line in lines">{{line.desc}}: {{line.total | currency}}</Line><Reminder If="!paid">Payment outstanding</Reminder></Invoice>"#};

    let out = compiler.compile_str(template).unwrap();
    assert_eq!(
        out,
        concat!(
            r#"<Invoice customer="Ada Lovelace">"#,
            r#"<Line n="0">Analytical engine: $1,200.00</Line>"#,
            r#"<Line n="1">Punch cards: $35.50</Line>"#,
            r#"<Reminder>Payment outstanding</Reminder>"#,
            r#"</Invoice>"#,
        )
    );
}
