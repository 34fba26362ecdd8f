use kube::CustomResourceExt;
use silta::crd::{AlertProvider, Canary, MetricTemplate};

fn main() {
    // Print all CRDs as one multi-document YAML stream for kubectl apply
    for crd in [
        serde_yaml::to_string(&Canary::crd()).expect("Failed to serialize Canary CRD"),
        serde_yaml::to_string(&MetricTemplate::crd())
            .expect("Failed to serialize MetricTemplate CRD"),
        serde_yaml::to_string(&AlertProvider::crd())
            .expect("Failed to serialize AlertProvider CRD"),
    ] {
        println!("---");
        print!("{}", crd);
    }
}
