//! Full-lifecycle test: create a cluster through fake providers, watch it
//! go active, then tear it down. Exercises naming, role assignment, load
//! balancer wiring order, bootstrap sequencing, and deletion order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use gantry::compute::{ComputeProvider, Instance, InstanceSpec, InstanceStatus};
use gantry::config::Timing;
use gantry::lb::{LbSpec, LoadBalancerApi};
use gantry::model::{
    AuthOptions, ClusterRequest, ClusterStatus, LbStatus, LoadBalancerRef, NodeRole,
};
use gantry::orchestrator::{Orchestrator, ProvisionDefaults};
use gantry::ssh::RemoteRunner;
use gantry::store::{ClusterStore, MemoryStore};
use gantry::{Error, Result};

const INIT_OUTPUT: &str = "kubeadm join 198.51.100.7:6443 \
    --token f2u46g.96nsmm6vn9u48xum \
    --discovery-token-ca-cert-hash sha256:6bd1eface8db2d6c7b3d235b \
    --control-plane --certificate-key a81d17c49a5dca76269720c9";

fn fast_timing() -> Timing {
    Timing {
        node_poll_interval: Duration::from_millis(2),
        node_deadline: Duration::from_millis(200),
        global_node_deadline: Duration::from_millis(400),
        settle_delay: Duration::from_millis(1),
        lb_poll_interval: Duration::from_millis(2),
        lb_wait_bound: Duration::from_millis(100),
        kubelet_restart_delay: Duration::from_millis(1),
        ssh_connect_timeout: Duration::from_millis(50),
    }
}

/// Compute fake: instances go active after two polls and remember the
/// order they were created and deleted in.
#[derive(Default)]
struct FakeCompute {
    serial: AtomicU32,
    created: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
    polls: Mutex<HashMap<String, u32>>,
    instances: Mutex<HashMap<String, Instance>>,
}

#[async_trait]
impl ComputeProvider for FakeCompute {
    async fn create_instance(&self, _auth: &AuthOptions, spec: &InstanceSpec) -> Result<Instance> {
        let n = self.serial.fetch_add(1, Ordering::SeqCst) + 1;
        self.created.lock().unwrap().push(spec.name.clone());
        let instance = Instance {
            id: format!("i-{n}"),
            name: spec.name.clone(),
            status: InstanceStatus::Build,
            access_ip: String::new(),
            admin_pass: Some(format!("pass-{n}")),
            metadata: spec.metadata.clone(),
        };
        self.instances
            .lock()
            .unwrap()
            .insert(instance.id.clone(), instance.clone());
        Ok(instance)
    }

    async fn get_instance(&self, _auth: &AuthOptions, id: &str) -> Result<Instance> {
        let mut instance = self
            .instances
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::compute(format!("no instance {id}")))?;

        let mut polls = self.polls.lock().unwrap();
        let count = polls.entry(id.to_string()).or_insert(0);
        *count += 1;
        if *count >= 2 {
            instance.status = InstanceStatus::Active;
            instance.access_ip = format!("10.9.0.{}", id.trim_start_matches("i-"));
            instance.admin_pass = None;
        }
        Ok(instance)
    }

    async fn delete_instance(&self, _auth: &AuthOptions, id: &str) -> Result<()> {
        let name = self
            .instances
            .lock()
            .unwrap()
            .get(id)
            .map(|i| i.name.clone())
            .unwrap_or_else(|| id.to_string());
        self.deleted.lock().unwrap().push(name);
        Ok(())
    }

    async fn list_instances(&self, _auth: &AuthOptions, name_prefix: &str) -> Result<Vec<Instance>> {
        Ok(self
            .instances
            .lock()
            .unwrap()
            .values()
            .filter(|i| i.name.starts_with(name_prefix))
            .cloned()
            .collect())
    }
}

/// Load balancer fake: active after one poll, records every attach
#[derive(Default)]
struct FakeLb {
    created: Mutex<Vec<LbSpec>>,
    attaches: Mutex<Vec<Vec<String>>>,
    deleted: Mutex<Vec<String>>,
    stuck_in_build: bool,
}

fn lb_ref(name: &str, status: LbStatus) -> LoadBalancerRef {
    LoadBalancerRef {
        id: "lb-1".into(),
        name: name.into(),
        protocol: "HTTPS".into(),
        port: 6443,
        status,
        virtual_ips: if status.is_active() {
            vec!["198.51.100.7".into()]
        } else {
            vec![]
        },
    }
}

#[async_trait]
impl LoadBalancerApi for FakeLb {
    async fn create(&self, _auth: &AuthOptions, spec: &LbSpec) -> Result<LoadBalancerRef> {
        self.created.lock().unwrap().push(spec.clone());
        Ok(lb_ref(&spec.name, LbStatus::Build))
    }

    async fn get(&self, _auth: &AuthOptions, _id: &str) -> Result<LoadBalancerRef> {
        let name = self.created.lock().unwrap()[0].name.clone();
        if self.stuck_in_build {
            Ok(lb_ref(&name, LbStatus::Build))
        } else {
            Ok(lb_ref(&name, LbStatus::Active))
        }
    }

    async fn delete(&self, _auth: &AuthOptions, id: &str) -> Result<()> {
        self.deleted.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn attach_nodes(
        &self,
        _auth: &AuthOptions,
        _id: &str,
        addresses: &[String],
        port: u16,
    ) -> Result<()> {
        assert_eq!(port, 6443);
        self.attaches.lock().unwrap().push(addresses.to_vec());
        Ok(())
    }
}

/// Remote runner fake recording every command with its target
struct FakeRunner {
    commands: Mutex<Vec<(String, String)>>,
    init_output: String,
}

impl FakeRunner {
    fn new(init_output: &str) -> Self {
        Self {
            commands: Mutex::new(Vec::new()),
            init_output: init_output.to_string(),
        }
    }
}

#[async_trait]
impl RemoteRunner for FakeRunner {
    async fn run(&self, command: &str, host: &str, _credential: &str) -> Result<String> {
        self.commands
            .lock()
            .unwrap()
            .push((command.to_string(), host.to_string()));
        if command.contains("kubeadm init") {
            Ok(self.init_output.clone())
        } else {
            Ok(String::new())
        }
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    compute: Arc<FakeCompute>,
    lb: Arc<FakeLb>,
    runner: Arc<FakeRunner>,
    orchestrator: Arc<Orchestrator>,
}

fn harness_with(lb: FakeLb, runner: FakeRunner) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let compute = Arc::new(FakeCompute::default());
    let lb = Arc::new(lb);
    let runner = Arc::new(runner);
    let timing = fast_timing();

    let orchestrator = Orchestrator::new(
        store.clone(),
        compute.clone(),
        gantry::lb::LbManager::new(lb.clone(), timing.lb_poll_interval, timing.lb_wait_bound),
        runner.clone(),
        timing,
        ProvisionDefaults {
            image: "img-ubuntu".into(),
            flavor: "5".into(),
            user_data: Some("I2Nsb3VkLWNvbmZpZw==".into()),
        },
    );
    Harness {
        store,
        compute,
        lb,
        runner,
        orchestrator,
    }
}

fn harness() -> Harness {
    harness_with(FakeLb::default(), FakeRunner::new(INIT_OUTPUT))
}

fn auth() -> AuthOptions {
    AuthOptions {
        auth_type: "Token".into(),
        token: "tok".into(),
        username: "alice".into(),
        password: String::new(),
        project_id: "proj".into(),
    }
}

fn request() -> ClusterRequest {
    ClusterRequest {
        name: "demo".into(),
        masters: Some(3),
        workers: 2,
        external_etcd: false,
        etcd: 0,
    }
}

async fn wait_terminal(harness: &Harness, uuid: Uuid) -> gantry::model::Cluster {
    for _ in 0..500 {
        let cluster = harness.store.find_one("proj", uuid).await.unwrap();
        if matches!(cluster.status, ClusterStatus::Active | ClusterStatus::Failed) {
            return cluster;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("cluster never reached a terminal status");
}

#[tokio::test]
async fn full_create_then_delete_lifecycle() {
    let h = harness();
    let record = h.orchestrator.create(request(), auth()).await.unwrap();
    assert_eq!(record.status, ClusterStatus::Building);

    let cluster = wait_terminal(&h, record.uuid).await;
    assert_eq!(cluster.status, ClusterStatus::Active);

    // VMs requested masters-first with canonical names
    assert_eq!(
        *h.compute.created.lock().unwrap(),
        vec![
            "k8s-demo-master-1",
            "k8s-demo-master-2",
            "k8s-demo-master-3",
            "k8s-demo-worker-1",
            "k8s-demo-worker-2",
        ]
    );

    // Roles per group
    assert_eq!(
        cluster.master_nodes[0].roles,
        vec![NodeRole::Master, NodeRole::Controlplane]
    );
    assert_eq!(cluster.worker_nodes[0].roles, vec![NodeRole::Worker]);
    for node in cluster.all_nodes() {
        assert!(node.ip.starts_with("10.9.0."), "no address on {}", node.name);
    }

    // One HTTPS load balancer on the control-plane port
    {
        let created = h.lb.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].name, "demo-k8s-lb");
        assert_eq!(created[0].protocol, "HTTPS");
        assert_eq!(created[0].port, 6443);
    }

    // Attach order: first master alone, then the remaining two; workers
    // are never attached
    {
        let attaches = h.lb.attaches.lock().unwrap();
        assert_eq!(attaches.len(), 2);
        assert_eq!(attaches[0], vec![cluster.master_nodes[0].ip.clone()]);
        assert_eq!(
            attaches[1],
            vec![
                cluster.master_nodes[1].ip.clone(),
                cluster.master_nodes[2].ip.clone(),
            ]
        );
        for batch in attaches.iter() {
            for addr in batch {
                assert!(!cluster.worker_nodes.iter().any(|w| &w.ip == addr));
            }
        }
    }

    // Bootstrap ran init on master-1 against the virtual address, then
    // joins, then the CNI apply, then worker joins
    {
        let commands = h.runner.commands.lock().unwrap();
        let ordered: Vec<&(String, String)> = commands
            .iter()
            .filter(|(c, _)| !c.contains("service kubelet"))
            .collect();
        assert!(ordered[0].0.contains("kubeadm init"));
        assert!(ordered[0].0.contains("'198.51.100.7:6443'"));
        assert_eq!(ordered[0].1, cluster.master_nodes[0].ip);
        assert!(ordered[1].0.contains("--control-plane --certificate-key"));
        assert!(ordered[3].0.contains("kubectl"));
        assert!(ordered[4].0.contains("kubeadm join"));
        assert!(!ordered[4].0.contains("--control-plane"));
    }

    // Teardown: workers before masters, LB removed, record soft-deleted
    h.orchestrator
        .delete("proj", record.uuid, auth())
        .await
        .unwrap();
    assert_eq!(
        *h.compute.deleted.lock().unwrap(),
        vec![
            "k8s-demo-worker-1",
            "k8s-demo-worker-2",
            "k8s-demo-master-1",
            "k8s-demo-master-2",
            "k8s-demo-master-3",
        ]
    );
    assert_eq!(*h.lb.deleted.lock().unwrap(), vec!["lb-1"]);
    assert!(h.store.find_all("proj").await.unwrap().is_empty());
    assert!(h.store.find_one("proj", record.uuid).await.is_err());
}

#[tokio::test]
async fn init_output_without_credentials_fails_the_cluster() {
    let h = harness_with(FakeLb::default(), FakeRunner::new("nothing useful"));
    let record = h.orchestrator.create(request(), auth()).await.unwrap();

    let cluster = wait_terminal(&h, record.uuid).await;
    assert_eq!(cluster.status, ClusterStatus::Failed);

    // No join was ever attempted
    let commands = h.runner.commands.lock().unwrap();
    assert!(!commands.iter().any(|(c, _)| c.contains("kubeadm join")));
}

#[tokio::test]
async fn load_balancer_stuck_in_build_fails_without_attaching() {
    let h = harness_with(
        FakeLb {
            stuck_in_build: true,
            ..FakeLb::default()
        },
        FakeRunner::new(INIT_OUTPUT),
    );
    let record = h.orchestrator.create(request(), auth()).await.unwrap();

    let cluster = wait_terminal(&h, record.uuid).await;
    assert_eq!(cluster.status, ClusterStatus::Failed);
    assert!(h.lb.attaches.lock().unwrap().is_empty());
    // Bootstrap never started either
    assert!(h.runner.commands.lock().unwrap().is_empty());
}

#[tokio::test]
async fn external_etcd_nodes_are_provisioned_and_deleted_last() {
    let h = harness();
    let record = h
        .orchestrator
        .create(
            ClusterRequest {
                name: "etcd-demo".into(),
                masters: Some(1),
                workers: 1,
                external_etcd: true,
                etcd: 3,
            },
            auth(),
        )
        .await
        .unwrap();

    let cluster = wait_terminal(&h, record.uuid).await;
    assert_eq!(cluster.status, ClusterStatus::Active);
    assert_eq!(cluster.etcd_nodes.len(), 3);
    assert_eq!(
        cluster.etcd_nodes[0].roles,
        vec![NodeRole::Etcd, NodeRole::Controlplane]
    );

    h.orchestrator
        .delete("proj", record.uuid, auth())
        .await
        .unwrap();
    let deleted = h.compute.deleted.lock().unwrap();
    assert_eq!(
        *deleted,
        vec![
            "k8s-etcd-demo-worker-1",
            "k8s-etcd-demo-master-1",
            "k8s-etcd-demo-etcd-1",
            "k8s-etcd-demo-etcd-2",
            "k8s-etcd-demo-etcd-3",
        ]
    );
}

#[tokio::test]
async fn concurrent_delete_of_a_building_cluster_is_a_conflict() {
    // The stuck load balancer keeps the creation run in flight long
    // enough to observe the single-writer guard
    let h = harness_with(
        FakeLb {
            stuck_in_build: true,
            ..FakeLb::default()
        },
        FakeRunner::new(INIT_OUTPUT),
    );
    let record = h.orchestrator.create(request(), auth()).await.unwrap();

    match h.orchestrator.delete("proj", record.uuid, auth()).await {
        Err(e) => {
            assert!(matches!(e, Error::Conflict(_)), "got {e}");
            // Once the canceled run unwinds, deletion succeeds
            wait_terminal(&h, record.uuid).await;
            h.orchestrator
                .delete("proj", record.uuid, auth())
                .await
                .unwrap();
        }
        // The run finished before the delete landed; nothing contended
        Ok(()) => {}
    }
    assert!(h.store.find_all("proj").await.unwrap().is_empty());
}
