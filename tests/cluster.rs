//! Whole-cluster tests: compute nodes, a broker and clients talking QUIC over
//! loopback.

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use golnet::{
    broker::{self, discovery::Discovery, BrokerClient},
    driver::{
        encode_pgm, Command, Distributor, Event, Io, LiveView, Outcome, Params,
        State,
    },
    net::{Endpoint, Request},
    node::NodeService,
    Cell, Error, Grid,
};
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};

fn trace() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn blinker() -> Grid {
    let cells = [Cell::new(0, 1), Cell::new(1, 1), Cell::new(2, 1)];
    Grid::with_alive(4, 4, &cells)
}

struct Cluster {
    broker: SocketAddr,
    broker_task: JoinHandle<Result<(), Error>>,
    nodes: Vec<SocketAddr>,
    node_tasks: Vec<JoinHandle<()>>,
}

impl Cluster {
    async fn start(nodes: usize) -> Self {
        trace();
        let mut addrs = Vec::new();
        let mut node_tasks = Vec::new();
        for _ in 0..nodes {
            let endpoint = Endpoint::server(loopback()).unwrap();
            addrs.push(endpoint.local_addr().unwrap());
            node_tasks.push(tokio::spawn(async move {
                endpoint.serve(Arc::new(NodeService)).await
            }));
        }

        let endpoint = Endpoint::server(loopback()).unwrap();
        let broker = endpoint.local_addr().unwrap();
        // An empty port range: only the listed nodes are dialled.
        #[allow(clippy::reversed_empty_ranges)]
        let discovery = Discovery::builder()
            .ports(1..=0)
            .nodes(addrs.clone())
            .build();
        let found = discovery.discover(&endpoint).await;
        assert_eq!(found.len(), nodes);
        let broker_task = tokio::spawn(broker::run(endpoint, found));
        Self {
            broker,
            broker_task,
            nodes: addrs,
            node_tasks,
        }
    }

    async fn client(&self) -> (Endpoint, BrokerClient) {
        let endpoint = Endpoint::client_for(self.broker).unwrap();
        let client = BrokerClient::connect(&endpoint, self.broker)
            .await
            .unwrap();
        (endpoint, client)
    }

    /// Waits for every node and the broker to stop serving.
    async fn stopped(self) {
        for task in self.node_tasks {
            timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        }
        timeout(Duration::from_secs(5), self.broker_task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir()
        .join(format!("golnet-cluster-{name}-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// An endless random run, for tests that end it with a command.
fn endless(width: u32, height: u32) -> Params {
    Params::builder()
        .turns(u32::MAX)
        .threads(3)
        .width(width)
        .height(height)
        .random(true)
        .build()
}

/// Keeps a viewer's queue moving and hands back everything it saw.
async fn drain(mut events: mpsc::Receiver<Event>) -> Vec<Event> {
    let mut seen = Vec::new();
    while let Some(event) = events.recv().await {
        seen.push(event);
    }
    seen
}

/// Keeps a viewer's queue moving while a test reads events as they come.
fn relay(mut events: mpsc::Receiver<Event>) -> mpsc::UnboundedReceiver<Event> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if tx.send(event).is_err() {
                break;
            }
        }
    });
    rx
}

async fn wait_for_state(
    events: &mut mpsc::UnboundedReceiver<Event>,
    wanted: State,
) -> u32 {
    let wait = async {
        loop {
            match events.recv().await {
                Some(Event::StateChange { turn, state }) if state == wanted => {
                    return turn
                }
                Some(_) => {}
                None => panic!("event stream closed before {wanted}"),
            }
        }
    };
    timeout(Duration::from_secs(10), wait).await.unwrap()
}

async fn wait_for_turn(client: &BrokerClient, turn: u32) -> u32 {
    loop {
        let (_, reached) = client.count_alive_cells().await.unwrap();
        if reached >= turn {
            return reached;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

#[tokio::test]
async fn blinker_oscillates_across_nodes() {
    let cluster = Cluster::start(2).await;
    let (_endpoint, client) = cluster.client().await;

    let (grid, turn) = client.advance_run(blinker(), 1, 2).await.unwrap();
    assert_eq!(turn, 1);
    assert_eq!(
        grid.alive_cells(),
        vec![Cell::new(1, 0), Cell::new(1, 1), Cell::new(1, 2)]
    );
    assert_eq!(client.count_alive_cells().await.unwrap(), (3, 1));

    let (grid, turn) = client.advance_run(blinker(), 2, 2).await.unwrap();
    assert_eq!(turn, 2);
    assert_eq!(grid, blinker());
    assert_eq!(client.count_alive_cells().await.unwrap(), (3, 2));
    assert_eq!(
        client.list_alive_cells().await.unwrap(),
        blinker().alive_cells()
    );
}

#[tokio::test]
async fn more_threads_than_nodes_and_rows() {
    let cluster = Cluster::start(2).await;
    let (_endpoint, client) = cluster.client().await;

    let (grid, turn) = client.advance_run(blinker(), 4, 7).await.unwrap();
    assert_eq!((grid, turn), (blinker(), 4));
    assert!(matches!(
        client.advance_run(blinker(), 4, 0).await,
        Err(Error::Remote(_))
    ));
}

#[tokio::test]
async fn pause_is_refused_between_runs() {
    let cluster = Cluster::start(1).await;
    let (_endpoint, client) = cluster.client().await;

    assert!(matches!(client.pause().await, Err(Error::Remote(_))));
    client.advance_run(blinker(), 1, 1).await.unwrap();
    assert!(matches!(client.pause().await, Err(Error::Remote(_))));
    assert!(matches!(client.resume().await, Err(Error::Remote(_))));
    // nothing was left paused for the next run
    let (_, turn) = client.advance_run(blinker(), 3, 1).await.unwrap();
    assert_eq!(turn, 3);
}

#[tokio::test]
async fn checkpoint_freezes_and_a_later_run_resumes() {
    let cluster = Cluster::start(2).await;
    let (_endpoint, client) = cluster.client().await;
    let seed = Grid::random(64, 48, 0.3, &mut rand::thread_rng());

    let run = tokio::spawn({
        let client = client.clone();
        let seed = seed.clone();
        async move { client.advance_run(seed, u32::MAX, 4).await }
    });
    wait_for_turn(&client, 3).await;

    client.pause().await.unwrap();
    // the turn in flight still lands
    tokio::time::sleep(Duration::from_millis(20)).await;
    let (_, held) = client.count_alive_cells().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.count_alive_cells().await.unwrap().1, held);
    client.resume().await.unwrap();
    wait_for_turn(&client, held + 1).await;

    client.checkpoint().await.unwrap();
    let (frozen_grid, frozen_turn) = run.await.unwrap().unwrap();
    let state = client.resumable_state().await.unwrap();
    assert!(state.resumable);
    assert_eq!(state.turn, frozen_turn);
    assert_eq!(state.grid, frozen_grid);

    // The seed is ignored in favour of the frozen session.
    let (_, turn) = client
        .advance_run(Grid::new(64, 48), frozen_turn + 2, 2)
        .await
        .unwrap();
    assert_eq!(turn, frozen_turn + 2);
    assert!(!client.resumable_state().await.unwrap().resumable);
}

#[tokio::test]
async fn flips_since_the_run_started() {
    let cluster = Cluster::start(1).await;
    let (_endpoint, client) = cluster.client().await;

    client.advance_run(blinker(), 1, 1).await.unwrap();
    let mut flipped: Vec<Cell> = client
        .flipped_since()
        .await
        .unwrap()
        .into_iter()
        .map(|flip| {
            assert_eq!(flip.turn, 1);
            flip.cell
        })
        .collect();
    flipped.sort();
    let mut expected = vec![
        Cell::new(0, 1),
        Cell::new(2, 1),
        Cell::new(1, 0),
        Cell::new(1, 2),
    ];
    expected.sort();
    assert_eq!(flipped, expected);
    assert!(client.flipped_since().await.unwrap().is_empty());
    assert_eq!(client.turn_completion_flag().await.unwrap(), (true, 1));
    assert_eq!(client.turn_completion_flag().await.unwrap(), (false, 1));
}

#[tokio::test]
async fn terminate_stops_every_node_and_the_broker() {
    let cluster = Cluster::start(2).await;
    let (_endpoint, client) = cluster.client().await;

    client.terminate().await.unwrap();
    cluster.stopped().await;
}

#[tokio::test]
async fn refused_shutdown_requests_leave_services_up() {
    let cluster = Cluster::start(1).await;
    let (endpoint, client) = cluster.client().await;

    // the broker does not serve Shutdown, nor a node Terminate
    assert!(matches!(
        client.link().call(&Request::Shutdown).await,
        Err(Error::Remote(_))
    ));
    let node = endpoint.connect(cluster.nodes[0]).await.unwrap();
    assert!(matches!(
        node.call(&Request::Terminate).await,
        Err(Error::Remote(_))
    ));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!cluster.broker_task.is_finished());
    assert!(cluster.node_tasks.iter().all(|task| !task.is_finished()));
    let (grid, turn) = client.advance_run(blinker(), 2, 1).await.unwrap();
    assert_eq!((grid, turn), (blinker(), 2));
}

#[tokio::test]
async fn distributor_runs_a_seeded_grid_to_the_end() {
    let cluster = Cluster::start(2).await;
    let (_endpoint, client) = cluster.client().await;
    let dir = scratch("seeded");
    std::fs::write(dir.join("4x4.pgm"), encode_pgm(&blinker())).unwrap();

    let params = Params::builder()
        .turns(10)
        .threads(2)
        .width(4)
        .height(4)
        .live_view(Duration::from_millis(1))
        .build();
    let (io, _) = Io::spawn(dir.clone(), dir.clone());
    let (events_tx, mut events_rx) = mpsc::channel(4096);
    let (_commands_tx, commands_rx) = mpsc::channel(1);

    let outcome = Distributor::new(params, client, io, events_tx)
        .run(commands_rx)
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Completed { turn: 10 });

    let mut events = Vec::new();
    while let Some(event) = events_rx.recv().await {
        events.push(event);
    }
    let mut view = LiveView::new();
    let flips = events
        .iter()
        .filter(|e| matches!(e, Event::CellFlipped { .. }));
    for event in flips {
        view.apply(event);
    }
    assert!(view.matches(&blinker()));
    assert!(events.contains(&Event::FinalTurnComplete {
        turn: 10,
        alive: blinker().alive_cells(),
    }));
    assert!(events.contains(&Event::ImageOutputComplete {
        turn: 10,
        filename: "4x4x10".into(),
    }));
    assert_eq!(
        events.last(),
        Some(&Event::StateChange {
            turn: 10,
            state: State::Quitting,
        })
    );

    let saved = std::fs::read(dir.join("4x4x10.pgm")).unwrap();
    assert_eq!(saved, encode_pgm(&blinker()));
    std::fs::remove_dir_all(dir).unwrap();
}

#[tokio::test]
async fn distributor_quit_leaves_a_resumable_run() {
    let cluster = Cluster::start(2).await;
    let (_endpoint, client) = cluster.client().await;
    let dir = scratch("quit");

    let params = endless(64, 64);
    let (io, _) = Io::spawn(dir.clone(), dir.clone());
    let (events_tx, events_rx) = mpsc::channel(1024);
    let (commands_tx, commands_rx) = mpsc::channel(1);
    let drained = tokio::spawn(drain(events_rx));

    let driver =
        Distributor::new(params.clone(), client.clone(), io.clone(), events_tx);
    let run = tokio::spawn(driver.run(commands_rx));
    wait_for_turn(&client, 5).await;
    commands_tx.send(Command::Quit).await.unwrap();
    let outcome = timeout(Duration::from_secs(10), run).await.unwrap();
    let Outcome::Quit { turn } = outcome.unwrap().unwrap() else {
        panic!("expected the run to quit");
    };
    assert!(turn >= 5);
    let state = client.resumable_state().await.unwrap();
    assert!(state.resumable);
    assert_eq!(state.turn, turn);
    assert!(dir.join(format!("{}.pgm", params.output_key(turn))).exists());

    let events = drained.await.unwrap();
    assert!(!events
        .iter()
        .any(|e| matches!(e, Event::FinalTurnComplete { .. })));
    assert_eq!(
        events.last(),
        Some(&Event::StateChange {
            turn,
            state: State::Quitting,
        })
    );

    // A second driver picks up where the first one stopped.
    let params = Params::builder()
        .turns(turn + 3)
        .threads(3)
        .width(64)
        .height(64)
        .random(true)
        .build();
    let (events_tx, events_rx) = mpsc::channel(1024);
    let (_commands_tx, commands_rx) = mpsc::channel(1);
    tokio::spawn(drain(events_rx));
    let outcome = Distributor::new(params, client, io, events_tx)
        .run(commands_rx)
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Completed { turn: turn + 3 });
    std::fs::remove_dir_all(dir).unwrap();
}

#[tokio::test]
async fn distributor_kill_saves_and_stops_the_cluster() {
    let cluster = Cluster::start(2).await;
    let (_endpoint, client) = cluster.client().await;
    let dir = scratch("kill");

    let params = endless(64, 64);
    let (io, _) = Io::spawn(dir.clone(), dir.clone());
    let (events_tx, events_rx) = mpsc::channel(1024);
    let (commands_tx, commands_rx) = mpsc::channel(1);
    let drained = tokio::spawn(drain(events_rx));

    let driver =
        Distributor::new(params.clone(), client.clone(), io, events_tx);
    let run = tokio::spawn(driver.run(commands_rx));
    wait_for_turn(&client, 3).await;
    commands_tx.send(Command::Kill).await.unwrap();
    let outcome = timeout(Duration::from_secs(10), run).await.unwrap();
    let Outcome::Killed { turn } = outcome.unwrap().unwrap() else {
        panic!("expected the run to be killed");
    };
    assert!(turn >= 3);
    assert!(dir.join(format!("{}.pgm", params.output_key(turn))).exists());

    let events = drained.await.unwrap();
    assert!(!events
        .iter()
        .any(|e| matches!(e, Event::FinalTurnComplete { .. })));
    assert_eq!(
        events.last(),
        Some(&Event::StateChange {
            turn,
            state: State::Quitting,
        })
    );

    cluster.stopped().await;
    std::fs::remove_dir_all(dir).unwrap();
}

#[tokio::test]
async fn distributor_toggles_pause_on_repeated_p() {
    let cluster = Cluster::start(2).await;
    let (_endpoint, client) = cluster.client().await;
    let dir = scratch("pause");

    let (io, _) = Io::spawn(dir.clone(), dir.clone());
    let (events_tx, events_rx) = mpsc::channel(1024);
    let (commands_tx, commands_rx) = mpsc::channel(1);
    let mut events = relay(events_rx);

    let driver =
        Distributor::new(endless(64, 64), client.clone(), io, events_tx);
    let run = tokio::spawn(driver.run(commands_rx));
    wait_for_turn(&client, 2).await;

    let p = Command::from_key('p').unwrap();
    commands_tx.send(p).await.unwrap();
    wait_for_state(&mut events, State::Paused).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let (_, held) = client.count_alive_cells().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.count_alive_cells().await.unwrap().1, held);

    commands_tx.send(p).await.unwrap();
    wait_for_state(&mut events, State::Executing).await;
    wait_for_turn(&client, held + 1).await;

    commands_tx.send(Command::Quit).await.unwrap();
    let outcome = timeout(Duration::from_secs(10), run).await.unwrap();
    assert!(matches!(outcome.unwrap().unwrap(), Outcome::Quit { .. }));
    std::fs::remove_dir_all(dir).unwrap();
}
