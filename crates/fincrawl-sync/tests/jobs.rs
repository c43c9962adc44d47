use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDate;
use fincrawl_adapters::{RawFrame, VendorCallError, VendorClient, VendorRequest};
use fincrawl_core::{far_future, far_past, Record, Value};
use fincrawl_storage::{MemoryStore, RecordStore};
use fincrawl_sync::schemas::{
    FUND_DESCRIPTION, FUND_MANAGER, FUND_NAV, FUND_SALE, INDEX_DESCRIPTION, INDEX_PRICE,
};
use fincrawl_sync::{
    ArgumentError, IndexSettings, JobArgs, JobContext, JobError, JobRegistry, JobRunner,
};
use serde_json::{json, Value as JsonValue};
use tracing_test::traced_test;

type Handler = Box<dyn Fn(&VendorRequest) -> Result<RawFrame, VendorCallError> + Send + Sync>;

/// Vendor double answering from a closure and recording every request.
struct ScriptedVendor {
    handler: Handler,
    calls: Mutex<Vec<VendorRequest>>,
}

impl ScriptedVendor {
    fn new(
        handler: impl Fn(&VendorRequest) -> Result<RawFrame, VendorCallError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn silent() -> Arc<Self> {
        Self::new(|_| Ok(RawFrame::default()))
    }

    fn calls(&self) -> Vec<VendorRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl VendorClient for ScriptedVendor {
    fn vendor_id(&self) -> &'static str {
        "scripted"
    }

    async fn call(&self, request: &VendorRequest) -> Result<RawFrame, VendorCallError> {
        self.calls.lock().unwrap().push(request.clone());
        (self.handler)(request)
    }
}

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn frame(fields: &[&str], items: Vec<Vec<JsonValue>>) -> RawFrame {
    RawFrame::new(fields.iter().map(|f| f.to_string()).collect(), items)
}

fn api_error(request: &VendorRequest) -> VendorCallError {
    VendorCallError::Api {
        api: request.api_name.clone(),
        code: 50101,
        message: "server busy".into(),
    }
}

fn runner(
    store: &Arc<MemoryStore>,
    tushare: &Arc<ScriptedVendor>,
    fund_sales: &Arc<ScriptedVendor>,
    today: NaiveDate,
) -> JobRunner {
    let ctx = JobContext::new(store.clone(), tushare.clone(), fund_sales.clone()).with_today(today);
    JobRunner::new(JobRegistry::builtin(), ctx)
}

fn fund(code: &str, setup: NaiveDate) -> Record {
    Record::new()
        .with("wind_code", code)
        .with("setup_date", setup)
        .with("maturity_date", far_future())
}

#[traced_test]
#[tokio::test]
async fn fund_nav_keeps_first_window_when_second_fails() {
    let store = Arc::new(MemoryStore::new());
    store
        .seed(
            FUND_DESCRIPTION,
            [fund("000001.OF", d(2010, 1, 1)), fund("1234567.OF", d(2010, 1, 1))],
        )
        .await;
    let tushare = ScriptedVendor::new(|request| {
        if request.params["start_date"] != "20091225" {
            return Err(api_error(request));
        }
        Ok(frame(
            &["ts_code", "ann_date", "end_date", "unit_nav", "accum_nav", "adj_nav"],
            vec![
                vec![json!("000001.OF"), json!("20100109"), json!("20100108"), json!(1.0), json!(1.0), json!(1.5)],
                vec![json!("000001.OF"), json!("20100112"), json!("20100111"), json!(1.2), json!(1.2), json!(1.8)],
            ],
        ))
    });
    let runner = runner(&store, &tushare, &ScriptedVendor::silent(), d(2024, 3, 1));

    let summary = runner.run("fund_nav", &JobArgs::default()).await.unwrap();

    let calls = tushare.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|c| c.params["ts_code"] == "000001.OF"));
    assert_eq!(summary.entities, 1);
    assert_eq!(summary.failures, 1);
    assert!(!summary.halted);
    assert_eq!(summary.records_written, 2);

    let navs = store.rows(FUND_NAV).await;
    assert_eq!(navs.len(), 2);
    assert_eq!(navs[0].value("trade_dt"), &Value::Date(d(2010, 1, 8)));
    assert_eq!(navs[0].value("acc_nav"), &Value::Float(1.0));
    assert_eq!(navs[1].value("adj_factor"), &Value::Float(1.5));

    logs_assert(|lines: &[&str]| {
        let failures = lines
            .iter()
            .filter(|line| line.contains("VendorCallError") && line.contains("entity=000001.OF"))
            .count();
        match failures {
            1 => Ok(()),
            n => Err(format!("expected one VendorCallError entry for 000001.OF, found {n}")),
        }
    });
}

#[tokio::test]
async fn unreadable_frame_is_rejected_without_ending_the_job() {
    let store = Arc::new(MemoryStore::new());
    store.seed(FUND_DESCRIPTION, [fund("000001.OF", d(2010, 1, 1))]).await;
    let tushare = ScriptedVendor::new(|request| {
        let fields = ["ts_code", "end_date", "unit_nav", "accum_nav", "adj_nav"];
        let row = if request.params["start_date"] == "20091225" {
            vec![json!("000001.OF"), json!("20100108")]
        } else {
            vec![json!("000001.OF"), json!("20180401"), json!(2.0), json!(2.0), json!(2.0)]
        };
        Ok(frame(&fields, vec![row]))
    });
    let runner = runner(&store, &tushare, &ScriptedVendor::silent(), d(2024, 3, 1));

    let summary = runner.run("fund_nav", &JobArgs::default()).await.unwrap();

    assert_eq!(tushare.calls().len(), 2);
    assert_eq!(summary.rejected_rows, 1);
    assert_eq!(summary.failures, 0);
    assert_eq!(summary.records_written, 1);
    let navs = store.rows(FUND_NAV).await;
    assert_eq!(navs.len(), 1);
    assert_eq!(navs[0].value("trade_dt"), &Value::Date(d(2018, 4, 1)));
}

#[tokio::test]
async fn systemic_failure_halts_the_run() {
    let store = Arc::new(MemoryStore::new());
    store
        .seed(
            FUND_DESCRIPTION,
            [fund("000001.OF", d(2023, 1, 1)), fund("000002.OF", d(2023, 1, 1))],
        )
        .await;
    let tushare = ScriptedVendor::new(|request| {
        Err(VendorCallError::Auth {
            api: request.api_name.clone(),
            message: "token expired".into(),
        })
    });
    let runner = runner(&store, &tushare, &ScriptedVendor::silent(), d(2024, 3, 1));

    let summary = runner.run("fund_nav", &JobArgs::default()).await.unwrap();

    assert_eq!(tushare.calls().len(), 1);
    assert!(summary.halted);
    assert_eq!(summary.failures, 1);
    assert_eq!(store.row_count(FUND_NAV).await, 0);
}

#[tokio::test]
async fn fund_description_fills_open_ended_maturity() {
    let store = Arc::new(MemoryStore::new());
    let tushare = ScriptedVendor::new(|request| {
        let fields = [
            "ts_code", "name", "fund_type", "type", "found_date", "due_date", "m_fee",
        ];
        let row = match request.params["market"].as_str() {
            "O" => vec![json!("000001.OF"), json!("Fund One"), json!("Equity"), json!("Contract"), json!("20040101"), JsonValue::Null, json!(1.5)],
            _ => vec![json!("510050.SH"), json!("ETF"), json!("Equity"), json!("Listed"), JsonValue::Null, JsonValue::Null, json!("-")],
        };
        Ok(frame(&fields, vec![row]))
    });
    let runner = runner(&store, &tushare, &ScriptedVendor::silent(), d(2024, 3, 1));

    let summary = runner.run("fund_description", &JobArgs::default()).await.unwrap();

    assert_eq!(tushare.calls().len(), 2);
    assert_eq!(summary.records_written, 2);
    let rows = store.rows(FUND_DESCRIPTION).await;
    let open = rows.iter().find(|r| r.value("wind_code").as_text() == Some("000001.OF")).unwrap();
    assert_eq!(open.value("maturity_date"), &Value::Date(far_future()));
    assert_eq!(open.value("short_name"), &Value::Text("Fund One".into()));
    assert_eq!(open.value("invest_type"), &Value::Text("Equity".into()));
    assert_eq!(open.value("fund_type"), &Value::Text("Contract".into()));
    let listed = rows.iter().find(|r| r.value("wind_code").as_text() == Some("510050.SH")).unwrap();
    assert!(listed.is_null("maturity_date"));
    assert!(listed.is_null("m_fee"));
}

#[tokio::test]
async fn index_description_tags_each_source() {
    let store = Arc::new(MemoryStore::new());
    let tushare = ScriptedVendor::new(|request| {
        let fields = ["ts_code", "name", "market", "category", "exp_date"];
        let row = match (request.api_name.as_str(), request.params.get("ts_code")) {
            ("index_basic", None) => {
                vec![json!("000300.SH"), json!("CSI 300"), json!("CSI"), json!("scale"), JsonValue::Null]
            }
            ("index_basic", Some(code)) => {
                vec![json!(code), json!("Extra"), json!("OTH"), JsonValue::Null, json!("20301231")]
            }
            _ => vec![json!("F1.WI"), json!("Fund index"), JsonValue::Null, JsonValue::Null, JsonValue::Null],
        };
        Ok(frame(&fields, vec![row]))
    });
    let settings = IndexSettings {
        markets: vec!["CSI".into()],
        extra_codes: [("H1.CSI".to_string(), "647002000".to_string())].into(),
        ..IndexSettings::default()
    };
    let ctx = JobContext::new(store.clone(), tushare.clone(), ScriptedVendor::silent())
        .with_index_settings(settings)
        .with_today(d(2024, 3, 1));
    let runner = JobRunner::new(JobRegistry::builtin(), ctx);

    let summary = runner.run("index_description", &JobArgs::default()).await.unwrap();

    let calls = tushare.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0].params["market"], "CSI");
    assert_eq!(calls[1].api_name, "index_description");
    assert_eq!(calls[2].params["ts_code"], "H1.CSI");
    assert_eq!(summary.records_written, 3);

    let rows = store.rows(INDEX_DESCRIPTION).await;
    let by_code = |code: &str| {
        rows.iter()
            .find(|r| r.value("wind_code").as_text() == Some(code))
            .cloned()
            .unwrap()
    };
    let listed = by_code("000300.SH");
    assert_eq!(listed.value("expire_date"), &Value::Date(far_future()));
    assert_eq!(listed.value("short_name"), &Value::Text("CSI 300".into()));
    assert!(listed.is_null("localized"));
    assert_eq!(listed.value("index_code"), &Value::Text("scale".into()));
    let fund_index = by_code("F1.WI");
    assert_eq!(fund_index.value("index_code"), &Value::Text("647006000".into()));
    assert_eq!(fund_index.value("localized"), &Value::Int(1));
    let extra = by_code("H1.CSI");
    assert_eq!(extra.value("index_code"), &Value::Text("647002000".into()));
    assert_eq!(extra.value("localized"), &Value::Int(-1));
    assert_eq!(extra.value("expire_date"), &Value::Date(d(2030, 12, 31)));
}

fn index(code: &str, category: &str, localized: Option<i64>) -> Record {
    Record::new()
        .with("wind_code", code)
        .with("base_date", d(2024, 1, 1))
        .with("expire_date", far_future())
        .with("index_code", category)
        .with("localized", localized)
}

fn price_rows(code: &str, days: &[&str]) -> RawFrame {
    frame(
        &["ts_code", "trade_date", "close"],
        days.iter().map(|day| vec![json!(code), json!(day), json!(100.0)]).collect(),
    )
}

fn api_and_code(calls: &[VendorRequest]) -> Vec<(String, String)> {
    calls
        .iter()
        .map(|c| (c.api_name.clone(), c.params["ts_code"].clone()))
        .collect()
}

#[tokio::test]
async fn index_price_refreshes_covered_codes_and_checks_new_ones() {
    let store = Arc::new(MemoryStore::new());
    store
        .seed(
            INDEX_DESCRIPTION,
            [
                index("A.CSI", "647000000", Some(1)),
                index("B.CSI", "647001000", None),
                index("C.CSI", "647001000", Some(0)),
                index("D.CSI", "999000000", None),
                index("E.WI", "647006000", Some(1)),
                index("X.CSI", "647002000", Some(-1)),
            ],
        )
        .await;
    let tushare = ScriptedVendor::new(|request| {
        let fields = ["ts_code", "trade_date", "close"];
        Ok(match request.params["ts_code"].as_str() {
            "A.CSI" => frame(
                &fields,
                vec![
                    vec![json!("A.CSI"), json!("20240102"), json!(100.0)],
                    vec![json!("A.CSI"), json!("20240102"), json!(101.0)],
                ],
            ),
            "B.CSI" => price_rows("B.CSI", &["20240102"]),
            "E.WI" => price_rows("E.WI", &["20240102"]),
            _ => frame(&fields, vec![]),
        })
    });
    let runner = runner(&store, &tushare, &ScriptedVendor::silent(), d(2024, 3, 1));

    let summary = runner
        .run("index_price", &JobArgs::positional(vec![json!(1), json!(1)]))
        .await
        .unwrap();

    let calls = tushare.calls();
    let expected: Vec<(String, String)> = [
        ("index_basic", "A.CSI"),
        ("index_basic", "B.CSI"),
        ("index_basic", "C.CSI"),
        ("index_basic", "D.CSI"),
        ("index_description", "E.WI"),
        ("index_daily", "B.CSI"),
        ("index_daily", "C.CSI"),
    ]
    .iter()
    .map(|(api, code)| (api.to_string(), code.to_string()))
    .collect();
    assert_eq!(api_and_code(&calls), expected);
    assert_eq!(calls[0].params["start_date"], "20231227");
    assert_eq!(calls[5].params["start_date"], "20240101");
    assert_eq!(summary.rows_removed, 2);

    let prices = store.rows(INDEX_PRICE).await;
    assert_eq!(prices.len(), 3);
    let a = prices.iter().find(|r| r.value("wind_code").as_text() == Some("A.CSI")).unwrap();
    assert_eq!(a.value("close_"), &Value::Float(101.0));

    let flags: Vec<(String, Value)> = store
        .rows(INDEX_DESCRIPTION)
        .await
        .into_iter()
        .map(|r| (r.value("wind_code").to_string(), r.value("localized").clone()))
        .collect();
    assert_eq!(
        flags,
        [
            ("A.CSI".to_string(), Value::Int(1)),
            ("B.CSI".to_string(), Value::Int(1)),
            ("C.CSI".to_string(), Value::Int(-1)),
            ("D.CSI".to_string(), Value::Null),
            ("E.WI".to_string(), Value::Int(1)),
            ("X.CSI".to_string(), Value::Int(-1)),
        ]
    );
}

#[tokio::test]
async fn new_code_check_keeps_code_whose_later_window_is_empty() {
    let store = Arc::new(MemoryStore::new());
    let mut old = index("G.CSI", "647001000", Some(0));
    old.set("base_date", d(2010, 1, 1));
    store.seed(INDEX_DESCRIPTION, [old]).await;
    let tushare = ScriptedVendor::new(|request| {
        Ok(match request.params["start_date"].as_str() {
            "20100101" => price_rows("G.CSI", &["20100104", "20100105"]),
            _ => RawFrame::default(),
        })
    });
    let runner = runner(&store, &tushare, &ScriptedVendor::silent(), d(2024, 3, 1));

    runner
        .run("index_price", &JobArgs::positional(vec![json!(0), json!(1)]))
        .await
        .unwrap();

    let calls = tushare.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|c| c.api_name == "index_daily"));
    assert_eq!(store.row_count(INDEX_PRICE).await, 2);
    let rows = store.rows(INDEX_DESCRIPTION).await;
    assert_eq!(rows[0].value("localized"), &Value::Int(1));
}

#[tokio::test]
async fn listed_indexes_get_prices_after_description_load() {
    let store = Arc::new(MemoryStore::new());
    let tushare = ScriptedVendor::new(|request| {
        if let Some(code) = request.params.get("start_date").map(|_| &request.params["ts_code"]) {
            return Ok(price_rows(code, &["20240102", "20240103"]));
        }
        let fields = ["ts_code", "name", "market", "category", "base_date", "exp_date"];
        let row = match request.api_name.as_str() {
            "index_basic" => vec![
                json!("000300.SH"),
                json!("CSI 300"),
                json!("CSI"),
                json!(647002000.0),
                json!("20240101"),
                JsonValue::Null,
            ],
            _ => vec![
                json!("F1.WI"),
                json!("Fund index"),
                JsonValue::Null,
                JsonValue::Null,
                json!("20240101"),
                JsonValue::Null,
            ],
        };
        Ok(frame(&fields, vec![row]))
    });
    let settings = IndexSettings {
        markets: vec!["CSI".into()],
        ..IndexSettings::default()
    };
    let ctx = JobContext::new(store.clone(), tushare.clone(), ScriptedVendor::silent())
        .with_index_settings(settings)
        .with_today(d(2024, 3, 1));
    let runner = JobRunner::new(JobRegistry::builtin(), ctx);

    runner.run("index_description", &JobArgs::default()).await.unwrap();
    let listed = store.rows(INDEX_DESCRIPTION).await;
    assert_eq!(listed[0].value("index_code"), &Value::Text("647002000".into()));

    let summary = runner
        .run("index_price", &JobArgs::positional(vec![json!(1), json!(1)]))
        .await
        .unwrap();

    let price_calls: Vec<VendorRequest> = tushare
        .calls()
        .into_iter()
        .filter(|c| c.params.contains_key("start_date"))
        .collect();
    let expected: Vec<(String, String)> = [
        ("index_basic", "000300.SH"),
        ("index_description", "F1.WI"),
        ("index_daily", "000300.SH"),
    ]
    .iter()
    .map(|(api, code)| (api.to_string(), code.to_string()))
    .collect();
    assert_eq!(api_and_code(&price_calls), expected);
    assert_eq!(summary.failures, 0);

    let prices = store.rows(INDEX_PRICE).await;
    let codes: std::collections::BTreeSet<&str> =
        prices.iter().filter_map(|r| r.value("wind_code").as_text()).collect();
    assert_eq!(codes, ["000300.SH", "F1.WI"].into());
    assert_eq!(prices.len(), 4);

    let flags = store.rows(INDEX_DESCRIPTION).await;
    assert_eq!(flags[0].value("localized"), &Value::Int(1));
    assert_eq!(flags[1].value("localized"), &Value::Int(1));
}

#[tokio::test]
async fn fund_manager_walks_funds_in_chunks() {
    let store = Arc::new(MemoryStore::new());
    store
        .seed(
            FUND_DESCRIPTION,
            (0..150).map(|i| fund(&format!("{i:06}.OF"), d(2020, 1, 1))),
        )
        .await;
    let tushare = ScriptedVendor::new(|request| {
        let first = request.params["ts_code"].split(',').next().unwrap_or_default().to_string();
        Ok(frame(
            &["ts_code", "ann_date", "name", "begin_date", "end_date"],
            vec![vec![json!(first), json!("20200101"), json!("Manager"), JsonValue::Null, JsonValue::Null]],
        ))
    });
    let runner = runner(&store, &tushare, &ScriptedVendor::silent(), d(2024, 3, 1));

    let summary = runner.run("fund_manager", &JobArgs::default()).await.unwrap();

    let sizes: Vec<usize> = tushare
        .calls()
        .iter()
        .map(|c| c.params["ts_code"].split(',').count())
        .collect();
    assert_eq!(sizes, [100, 50]);
    assert_eq!(summary.entities, 150);

    let managers = store.rows(FUND_MANAGER).await;
    assert_eq!(managers.len(), 2);
    assert_eq!(managers[0].value("start_dt"), &Value::Date(far_past()));
    assert_eq!(managers[0].value("end_dt"), &Value::Date(far_future()));
    assert_eq!(managers[0].value("manager_name"), &Value::Text("Manager".into()));
}

#[tokio::test]
async fn fund_sales_warns_on_truncated_listing_and_upserts() {
    let store = Arc::new(MemoryStore::new());
    let sales = ScriptedVendor::new(|_| {
        let mut page = frame(
            &["product_code", "product_id", "risk_level", "subscribe_start_time"],
            vec![
                vec![json!("P1"), json!("17"), json!("2"), json!("0")],
                vec![json!("P2"), json!("18"), json!(""), json!("20240201")],
            ],
        );
        page.has_more = true;
        page.total_rows = Some(4000);
        Ok(page)
    });
    let runner = runner(&store, &ScriptedVendor::silent(), &sales, d(2024, 3, 1));

    let summary = runner
        .run("fund_sales", &JobArgs::default().kwarg("n_records", json!(10)))
        .await
        .unwrap();

    assert_eq!(sales.calls()[0].params["numPerPage"], "10");
    assert_eq!(summary.records_written, 2);
    let rows = store.rows(FUND_SALE).await;
    assert_eq!(rows[0].value("product_id"), &Value::Int(17));
    assert!(rows[0].is_null("subscribe_start_time"));
    assert!(rows[1].is_null("risk_level"));
    assert_eq!(rows[1].value("subscribe_start_time"), &Value::Date(d(2024, 2, 1)));
}

#[tokio::test]
async fn bad_arguments_are_rejected_before_any_call() {
    let store = Arc::new(MemoryStore::new());
    let tushare = ScriptedVendor::silent();
    let runner = runner(&store, &tushare, &ScriptedVendor::silent(), d(2024, 3, 1));

    let err = runner
        .run("index_price", &JobArgs::positional(vec![json!("yes")]))
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::Argument(ArgumentError::WrongType { .. })));

    let err = runner
        .run("fund_sales", &JobArgs::default().kwarg("pages", json!(2)))
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::Argument(ArgumentError::UnknownKeyword(_))));

    let err = runner.run("no_such_job", &JobArgs::default()).await.unwrap_err();
    assert!(matches!(err, JobError::UnknownJob(name) if name == "no_such_job"));

    assert!(tushare.calls().is_empty());
}

#[tokio::test]
async fn clean_duplicates_job_targets_registered_tables() {
    let store = Arc::new(MemoryStore::new());
    let row = Record::new()
        .with("wind_code", "000001.OF")
        .with("trade_dt", d(2024, 1, 2))
        .with("unit_nav", 1.0);
    store.seed(FUND_NAV, [row.clone(), row.clone(), row]).await;
    let runner = runner(&store, &ScriptedVendor::silent(), &ScriptedVendor::silent(), d(2024, 3, 1));

    let summary = runner
        .run("clean_duplicates", &JobArgs::positional(vec![json!(FUND_NAV)]))
        .await
        .unwrap();
    assert_eq!(summary.rows_removed, 2);
    assert_eq!(store.row_count(FUND_NAV).await, 1);

    let err = runner
        .run("clean_duplicates", &JobArgs::positional(vec![json!("missing_table")]))
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::Argument(ArgumentError::Invalid { .. })));

    let err = runner.run("clean_duplicates", &JobArgs::default()).await.unwrap_err();
    assert!(matches!(err, JobError::Argument(ArgumentError::Missing(_))));

    let schema = fincrawl_sync::schemas::fund_nav().unwrap();
    assert_eq!(store.clean_duplicates(&schema, schema.key_columns()).await.unwrap(), 0);
}
