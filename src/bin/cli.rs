use clap::Parser;
use deform_jit::convert::{build_expr, ColumnRef, ColumnType};
use deform_jit::executor::{
    exec_eval_expr, Attribute, ExprContext, ExprState, HeapTuple, SlotSource, TupleDesc,
    TupleTableSlot, TupleValue,
};
use deform_jit::{CallSite, CodegenManager, ExecEvalExprFn};
use std::collections::HashMap;
use std::process;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "deform-jit-explain")]
#[command(about = "Compile a predicate over scan columns and explain the generated functions")]
#[command(version)]
struct Args {
    /// Predicate to compile, e.g. "a < 10 && c >= 0.5"
    expression: String,

    /// Scan columns in attribute order, as name:type (int2, int4, int8, float8, bool)
    #[arg(short, long, value_delimiter = ',', default_value = "a:int4,b:int8,c:float8")]
    columns: Vec<String>,

    /// Row to evaluate the predicate on, one value per column ("null" for a null)
    #[arg(short, long, value_delimiter = ',')]
    row: Vec<String>,

    /// Print the IR of the compiled module
    #[arg(long)]
    ir: bool,
}

fn main() {
    if let Ok(filter) = EnvFilter::try_from_env("DEFORM_JIT_LOG") {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    }

    let args = Args::parse();
    if let Err(e) = explain(&args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

struct Column {
    name: String,
    ty: ColumnType,
    attr: Attribute,
}

fn parse_columns(specs: &[String]) -> Result<Vec<Column>, Box<dyn std::error::Error>> {
    specs
        .iter()
        .map(|spec| {
            let (name, ty) = spec
                .split_once(':')
                .ok_or_else(|| format!("column `{}` is not name:type", spec))?;
            let (ty, attr) = match ty {
                // int2 columns compare as int4
                "int2" => (ColumnType::Int4, Attribute::int2()),
                "int4" => (ColumnType::Int4, Attribute::int4()),
                "int8" => (ColumnType::Int8, Attribute::int8()),
                "float8" => (ColumnType::Float8, Attribute::float8()),
                "bool" => (ColumnType::Bool, Attribute::bool()),
                other => return Err(format!("unknown column type `{}`", other).into()),
            };
            Ok(Column {
                name: name.to_string(),
                ty,
                attr,
            })
        })
        .collect()
}

fn parse_value(column: &Column, text: &str) -> Result<TupleValue, Box<dyn std::error::Error>> {
    if text.eq_ignore_ascii_case("null") {
        return Ok(TupleValue::Null);
    }
    Ok(match column.ty {
        ColumnType::Int4 | ColumnType::Int8 => TupleValue::Int(text.parse()?),
        ColumnType::Float8 => TupleValue::Float(text.parse()?),
        ColumnType::Bool => TupleValue::Int(text.parse::<bool>()? as i64),
    })
}

fn explain(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let columns = parse_columns(&args.columns)?;
    let column_map: HashMap<String, ColumnRef> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| {
            (
                c.name.clone(),
                ColumnRef::new(SlotSource::Scan, i as i32 + 1, c.ty),
            )
        })
        .collect();
    let expr = build_expr(&args.expression, &column_map)?;
    println!("Expression: {}", expr);

    let desc = Arc::new(TupleDesc::new(columns.iter().map(|c| c.attr).collect()));
    let mut slot = TupleTableSlot::new(Arc::clone(&desc));
    let mut econtext = ExprContext::new();
    econtext.set_slot(SlotSource::Scan, slot.as_mut_ptr());
    let mut state = ExprState::new(expr);

    let site = CallSite::new(exec_eval_expr as ExecEvalExprFn);
    let mut manager = CodegenManager::new("explain");
    if !manager.enroll_expr(Arc::clone(&site), &state, Some(&slot)) {
        println!("Expression is not supported by code generation; it will be interpreted");
    }
    manager.generate_code();
    if args.ir {
        print!("{}", manager.utils().print_underlying_modules());
    }
    manager.prepare_generated_functions();
    manager.accumulate_explain_string();
    print!("{}", manager.explain_string());

    if !args.row.is_empty() {
        if args.row.len() > columns.len() {
            return Err(format!("row has {} values for {} columns", args.row.len(), columns.len()).into());
        }
        let values = columns
            .iter()
            .zip(&args.row)
            .map(|(column, text)| parse_value(column, text))
            .collect::<Result<Vec<_>, _>>()?;
        slot.store_heap_tuple(Arc::new(HeapTuple::form(&desc, &values)));

        let mut isnull = false;
        // SAFETY: state, context and slot outlive the call
        let value = unsafe { (site.get())(state.as_mut_ptr(), econtext.as_mut_ptr(), &mut isnull) };
        if isnull {
            println!("Result: NULL");
        } else {
            println!("Result: {}", value != 0);
        }
    }
    Ok(())
}
